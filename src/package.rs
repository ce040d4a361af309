//! Package files and the symbol sources that read them.
//!
//! Container parsing lives behind [`SymbolSource`]. A module may be split
//! across several package files; each file holds ordered compilation units.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::symbol::{SymbolReference, SymbolTable};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageFile(PathBuf);

impl PackageFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for PackageFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One SDK module and its package files, in load order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModulePackage {
    pub name: String,
    pub files: Vec<PackageFile>,
}

impl ModulePackage {
    pub fn new(name: &str, files: Vec<PackageFile>) -> Self {
        Self {
            name: name.to_string(),
            files,
        }
    }
}

pub trait SymbolSource: Send {
    fn list_compilation_units(&self, package: &PackageFile) -> Result<Vec<UnitId>>;

    fn load_symbols(&self, package: &PackageFile, unit: &UnitId) -> Result<SymbolTable>;
}

impl<S: SymbolSource + ?Sized> SymbolSource for Box<S> {
    fn list_compilation_units(&self, package: &PackageFile) -> Result<Vec<UnitId>> {
        (**self).list_compilation_units(package)
    }

    fn load_symbols(&self, package: &PackageFile, unit: &UnitId) -> Result<SymbolTable> {
        (**self).load_symbols(package, unit)
    }
}

/// Record of `load_symbols` calls, shared with whoever created the source.
pub type LoadLog = Arc<Mutex<Vec<(PackageFile, UnitId)>>>;

#[derive(Clone, Debug)]
enum UnitEntry {
    Symbols(UnitId, SymbolTable),
    Unreadable(UnitId, String),
}

impl UnitEntry {
    fn id(&self) -> &UnitId {
        match self {
            UnitEntry::Symbols(id, _) | UnitEntry::Unreadable(id, _) => id,
        }
    }
}

/// Symbol source backed by in-memory tables, with injectable failures.
#[derive(Clone, Debug, Default)]
pub struct InMemorySymbolSource {
    packages: HashMap<PackageFile, Vec<UnitEntry>>,
    unreadable: HashMap<PackageFile, String>,
    loads: LoadLog,
}

impl InMemorySymbolSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, package: &PackageFile, unit: &str, symbols: SymbolTable) -> Self {
        self.packages
            .entry(package.clone())
            .or_default()
            .push(UnitEntry::Symbols(UnitId::new(unit), symbols));
        self
    }

    /// Adds a unit whose symbol table fails to load.
    pub fn with_unreadable_unit(mut self, package: &PackageFile, unit: &str, cause: &str) -> Self {
        self.packages
            .entry(package.clone())
            .or_default()
            .push(UnitEntry::Unreadable(UnitId::new(unit), cause.to_string()));
        self
    }

    /// Makes listing the units of `package` fail.
    pub fn with_unreadable_package(mut self, package: &PackageFile, cause: &str) -> Self {
        self.unreadable.insert(package.clone(), cause.to_string());
        self
    }

    pub fn load_log(&self) -> LoadLog {
        Arc::clone(&self.loads)
    }
}

impl SymbolSource for InMemorySymbolSource {
    fn list_compilation_units(&self, package: &PackageFile) -> Result<Vec<UnitId>> {
        if let Some(cause) = self.unreadable.get(package) {
            return Err(anyhow!("{}: {}", package, cause));
        }
        let units = self
            .packages
            .get(package)
            .ok_or_else(|| anyhow!("{}: no such package file", package))?;
        Ok(units.iter().map(|entry| entry.id().clone()).collect())
    }

    fn load_symbols(&self, package: &PackageFile, unit: &UnitId) -> Result<SymbolTable> {
        self.loads
            .lock()
            .map_err(|_| anyhow!("load log lock poisoned"))?
            .push((package.clone(), unit.clone()));
        let entry = self
            .packages
            .get(package)
            .and_then(|units| units.iter().find(|entry| entry.id() == unit))
            .ok_or_else(|| anyhow!("{}: no compilation unit {}", package, unit))?;
        match entry {
            UnitEntry::Symbols(_, symbols) => Ok(symbols.clone()),
            UnitEntry::Unreadable(_, cause) => Err(anyhow!("{} {}: {}", package, unit, cause)),
        }
    }
}

#[derive(Deserialize)]
struct ManifestUnitHeader {
    unit: String,
}

#[derive(Deserialize)]
struct ManifestUnit {
    #[serde(default)]
    symbols: Vec<(String, String)>,
}

/// Most symbol references a single compilation unit may carry.
pub const MAX_SYMBOLS_PER_UNIT: usize = 65_536;

/// Longest unit record accepted from a manifest, newline included.
pub const MAX_UNIT_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Reads JSON-lines symbol manifests, one compilation unit per line:
///
/// `{"unit": "classes.dex#0", "symbols": [["Lcom/x/Api", "foo;V"]]}`
///
/// Each lookup rescans the file so only the requested unit is held in memory.
/// Records longer than the byte limit, or units with more references than
/// the symbol limit, are rejected as unreadable.
#[derive(Clone, Copy, Debug)]
pub struct ManifestSymbolSource {
    max_symbols: usize,
    max_record_bytes: usize,
}

impl Default for ManifestSymbolSource {
    fn default() -> Self {
        Self {
            max_symbols: MAX_SYMBOLS_PER_UNIT,
            max_record_bytes: MAX_UNIT_RECORD_BYTES,
        }
    }
}

impl ManifestSymbolSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit_limits(mut self, max_symbols: usize, max_record_bytes: usize) -> Self {
        self.max_symbols = max_symbols;
        self.max_record_bytes = max_record_bytes;
        self
    }

    fn open(package: &PackageFile) -> Result<BufReader<File>> {
        let file = File::open(package.path())
            .with_context(|| format!("failed to open symbol manifest {}", package))?;
        Ok(BufReader::new(file))
    }

    /// Reads the next record into `buf`; `false` at end of file.
    fn next_record(
        &self,
        reader: &mut BufReader<File>,
        buf: &mut String,
        package: &PackageFile,
        line: usize,
    ) -> Result<bool> {
        buf.clear();
        let limit = u64::try_from(self.max_record_bytes)
            .unwrap_or(u64::MAX)
            .saturating_add(1);
        let read = reader
            .by_ref()
            .take(limit)
            .read_line(buf)
            .with_context(|| format!("failed to read {}", package))?;
        if read > self.max_record_bytes {
            return Err(anyhow!(
                "{} line {}: unit record exceeds {} bytes",
                package,
                line,
                self.max_record_bytes
            ));
        }
        Ok(read > 0)
    }
}

fn parse_record<'de, T: Deserialize<'de>>(raw: &'de str, package: &PackageFile, line: usize) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| anyhow!("{} line {}: invalid unit record: {}", package, line, e))
}

impl SymbolSource for ManifestSymbolSource {
    fn list_compilation_units(&self, package: &PackageFile) -> Result<Vec<UnitId>> {
        let mut reader = Self::open(package)?;
        let mut buf = String::new();
        let mut units: Vec<UnitId> = Vec::new();
        let mut line = 0usize;
        loop {
            line += 1;
            if !self.next_record(&mut reader, &mut buf, package, line)? {
                break;
            }
            if buf.trim().is_empty() {
                continue;
            }
            let header: ManifestUnitHeader = parse_record(&buf, package, line)?;
            let id = UnitId(header.unit);
            if units.contains(&id) {
                return Err(anyhow!("{}: duplicate compilation unit {}", package, id));
            }
            units.push(id);
        }
        Ok(units)
    }

    fn load_symbols(&self, package: &PackageFile, unit: &UnitId) -> Result<SymbolTable> {
        let mut reader = Self::open(package)?;
        let mut buf = String::new();
        let mut line = 0usize;
        loop {
            line += 1;
            if !self.next_record(&mut reader, &mut buf, package, line)? {
                break;
            }
            if buf.trim().is_empty() {
                continue;
            }
            let header: ManifestUnitHeader = parse_record(&buf, package, line)?;
            if header.unit != unit.0 {
                continue;
            }
            let record: ManifestUnit = parse_record(&buf, package, line)?;
            if record.symbols.len() > self.max_symbols {
                return Err(anyhow!(
                    "{} line {}: unit {} has {} symbol references, maximum is {}",
                    package,
                    line,
                    unit,
                    record.symbols.len(),
                    self.max_symbols
                ));
            }
            return Ok(record
                .symbols
                .into_iter()
                .map(|(class, signature)| SymbolReference {
                    referenced_class: class,
                    referenced_method_signature: signature,
                })
                .collect());
        }
        Err(anyhow!("{}: no compilation unit {}", package, unit))
    }
}
