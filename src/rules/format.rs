use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

use crate::rules::Rule;

pub const RULESET_MAGIC: &[u8; 4] = b"SDKA";
pub const RULESET_FORMAT_VERSION: u8 = 1;

/// Maximum length of any encoded string (class, method, descriptor).
const MAX_STRING_LEN: usize = 1024;

/// Maximum number of API levels in one file.
const MAX_LEVELS: usize = 4096;

/// Maximum number of rules for a single API level.
const MAX_RULES_PER_LEVEL: usize = 1_000_000;

/// Maximum number of parameter descriptors in a rule.
const MAX_PARAMS: usize = 255;

/// Allowlists for several API levels, as shipped in one rule-set file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleSetFile {
    pub levels: BTreeMap<u32, Vec<Rule>>,
}

impl RuleSetFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_level(&mut self, api_level: u32, rules: Vec<Rule>) -> Option<Vec<Rule>> {
        self.levels.insert(api_level, rules)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.levels.len() > MAX_LEVELS {
            return Err(anyhow!(
                "rule set holds {} levels, maximum is {}",
                self.levels.len(),
                MAX_LEVELS
            ));
        }
        let mut out = Vec::new();
        out.extend_from_slice(RULESET_MAGIC);
        out.push(RULESET_FORMAT_VERSION);
        write_count(&mut out, self.levels.len())?;
        for (level, rules) in &self.levels {
            if rules.len() > MAX_RULES_PER_LEVEL {
                return Err(anyhow!(
                    "api level {} holds {} rules, maximum is {}",
                    level,
                    rules.len(),
                    MAX_RULES_PER_LEVEL
                ));
            }
            out.extend_from_slice(&level.to_le_bytes());
            write_count(&mut out, rules.len())?;
            for rule in rules {
                encode_rule(&mut out, rule)?;
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let magic = read_slice(bytes, &mut cursor, RULESET_MAGIC.len())?;
        if magic != RULESET_MAGIC {
            return Err(anyhow!("not a rule set file (bad magic)"));
        }
        let version = read_u8(bytes, &mut cursor)?;
        if version != RULESET_FORMAT_VERSION {
            return Err(anyhow!("unsupported rule set format version {}", version));
        }
        let level_count = read_u32(bytes, &mut cursor)? as usize;
        if level_count > MAX_LEVELS {
            return Err(anyhow!(
                "level count {} exceeds maximum {}",
                level_count,
                MAX_LEVELS
            ));
        }
        let mut levels = BTreeMap::new();
        for _ in 0..level_count {
            let level = read_u32(bytes, &mut cursor)?;
            let rule_count = read_u32(bytes, &mut cursor)? as usize;
            if rule_count > MAX_RULES_PER_LEVEL {
                return Err(anyhow!(
                    "api level {} rule count {} exceeds maximum {}",
                    level,
                    rule_count,
                    MAX_RULES_PER_LEVEL
                ));
            }
            let mut rules = Vec::with_capacity(rule_count.min(1024));
            for _ in 0..rule_count {
                rules.push(decode_rule(bytes, &mut cursor)?);
            }
            if levels.insert(level, rules).is_some() {
                return Err(anyhow!("duplicate api level {} in rule set", level));
            }
        }
        if cursor != bytes.len() {
            return Err(anyhow!(
                "rule set has {} trailing bytes",
                bytes.len() - cursor
            ));
        }
        Ok(Self { levels })
    }

    /// SHA-256 of the encoded file, for binding verdicts to the rules used.
    pub fn digest(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }
}

fn encode_rule(out: &mut Vec<u8>, rule: &Rule) -> Result<()> {
    // An empty string on the wire means "absent", so `Some("")` would come
    // back as a wildcard.
    for (field, value) in [
        ("class", &rule.class_name),
        ("method", &rule.method_name),
        ("return type", &rule.return_type),
    ] {
        if value.as_deref() == Some("") {
            return Err(anyhow!("rule {} has an empty {} and cannot be encoded", rule, field));
        }
    }
    write_opt_str(out, rule.class_name.as_deref())?;
    write_opt_str(out, rule.method_name.as_deref())?;
    if rule.parameters.len() > MAX_PARAMS {
        return Err(anyhow!(
            "rule {} has {} parameters, maximum is {}",
            rule,
            rule.parameters.len(),
            MAX_PARAMS
        ));
    }
    write_count(out, rule.parameters.len())?;
    for param in &rule.parameters {
        write_str(out, param)?;
    }
    write_opt_str(out, rule.return_type.as_deref())?;
    out.push(u8::from(rule.allow));
    Ok(())
}

fn decode_rule(bytes: &[u8], cursor: &mut usize) -> Result<Rule> {
    let class_name = read_opt_str(bytes, cursor)?;
    let method_name = read_opt_str(bytes, cursor)?;
    let param_count = read_u32(bytes, cursor)? as usize;
    if param_count > MAX_PARAMS {
        return Err(anyhow!(
            "parameter count {} exceeds maximum {}",
            param_count,
            MAX_PARAMS
        ));
    }
    let mut parameters = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        parameters.push(read_str(bytes, cursor)?);
    }
    let return_type = read_opt_str(bytes, cursor)?;
    let allow = match read_u8(bytes, cursor)? {
        0 => false,
        1 => true,
        other => return Err(anyhow!("invalid allow flag {}", other)),
    };
    Ok(Rule {
        class_name,
        method_name,
        parameters,
        return_type,
        allow,
    })
}

fn write_count(out: &mut Vec<u8>, count: usize) -> Result<()> {
    let count = u32::try_from(count).map_err(|_| anyhow!("count {} exceeds u32", count))?;
    out.extend_from_slice(&count.to_le_bytes());
    Ok(())
}

fn write_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.len() > MAX_STRING_LEN {
        return Err(anyhow!(
            "string length {} exceeds maximum {}",
            value.len(),
            MAX_STRING_LEN
        ));
    }
    write_count(out, value.len())?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_opt_str(out: &mut Vec<u8>, value: Option<&str>) -> Result<()> {
    write_str(out, value.unwrap_or(""))
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8> {
    let slice = read_slice(bytes, cursor, 1)?;
    Ok(slice[0])
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Ok(u32::from_le_bytes(buf))
}

fn read_str(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u32(bytes, cursor)? as usize;
    if len > MAX_STRING_LEN {
        return Err(anyhow!(
            "string length {} exceeds maximum {}",
            len,
            MAX_STRING_LEN
        ));
    }
    let raw = read_slice(bytes, cursor, len)?;
    std::str::from_utf8(raw)
        .map(|s| s.to_string())
        .map_err(|_| anyhow!("invalid utf-8 in rule set string"))
}

fn read_opt_str(bytes: &[u8], cursor: &mut usize) -> Result<Option<String>> {
    let value = read_str(bytes, cursor)?;
    Ok(if value.is_empty() { None } else { Some(value) })
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .ok_or_else(|| anyhow!("rule set length overflow"))?;
    if end > bytes.len() {
        return Err(anyhow!("rule set truncated"));
    }
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}
