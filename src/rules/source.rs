use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::rules::{Rule, RuleSetFile};

/// Supplies the platform allowlist for an API level.
///
/// `Ok(None)` means no rule list exists for that level, which is not an
/// error. `Err` means the source itself could not be read.
pub trait RuleSetSource: Send + Sync {
    fn load_rules(&self, api_level: u32) -> Result<Option<Vec<Rule>>>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryRuleSetSource {
    levels: HashMap<u32, Vec<Rule>>,
}

impl InMemoryRuleSetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, api_level: u32, rules: Vec<Rule>) -> Self {
        self.levels.insert(api_level, rules);
        self
    }
}

impl RuleSetSource for InMemoryRuleSetSource {
    fn load_rules(&self, api_level: u32) -> Result<Option<Vec<Rule>>> {
        Ok(self.levels.get(&api_level).cloned())
    }
}

impl From<RuleSetFile> for InMemoryRuleSetSource {
    fn from(file: RuleSetFile) -> Self {
        Self {
            levels: file.levels.into_iter().collect(),
        }
    }
}

/// Rule set decoded from an encoded file on disk.
#[derive(Clone, Debug)]
pub struct FileRuleSetSource {
    path: PathBuf,
    digest: [u8; 32],
    rules: RuleSetFile,
}

impl FileRuleSetSource {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read rule set {}", path.display()))?;
        let rules = RuleSetFile::decode(&bytes)
            .with_context(|| format!("invalid rule set {}", path.display()))?;
        log::info!(
            "loaded rule set {} ({} api levels)",
            path.display(),
            rules.levels.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            digest: RuleSetFile::digest(&bytes),
            rules,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA-256 of the file as read.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn api_levels(&self) -> Vec<u32> {
        self.rules.levels.keys().copied().collect()
    }
}

impl RuleSetSource for FileRuleSetSource {
    fn load_rules(&self, api_level: u32) -> Result<Option<Vec<Rule>>> {
        Ok(self.rules.levels.get(&api_level).cloned())
    }
}
