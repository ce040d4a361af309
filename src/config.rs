use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_RULES_PATH: &str = "allowlist.bin";
const DEFAULT_API_LEVEL: u32 = 34;
const DEFAULT_WORKER_NAME: &str = "sdk-verifier";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VerifierConfigFile {
    rules_path: Option<PathBuf>,
    api_level: Option<u32>,
    enforce: Option<bool>,
    worker_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub rules_path: PathBuf,
    pub api_level: u32,
    /// When false, restricted usages are reported but do not block loading.
    pub enforce: bool,
    pub worker_name: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self::from_file(VerifierConfigFile::default())
    }
}

impl VerifierConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SDK_ALLOWLIST_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VerifierConfigFile) -> Self {
        Self {
            rules_path: file
                .rules_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RULES_PATH)),
            api_level: file.api_level.unwrap_or(DEFAULT_API_LEVEL),
            enforce: file.enforce.unwrap_or(true),
            worker_name: file
                .worker_name
                .unwrap_or_else(|| DEFAULT_WORKER_NAME.to_string()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SDK_ALLOWLIST_RULES_PATH") {
            if !path.trim().is_empty() {
                self.rules_path = PathBuf::from(path);
            }
        }
        if let Ok(level) = std::env::var("SDK_ALLOWLIST_API_LEVEL") {
            self.api_level = level
                .trim()
                .parse()
                .map_err(|_| anyhow!("SDK_ALLOWLIST_API_LEVEL must be a positive integer"))?;
        }
        if let Ok(enforce) = std::env::var("SDK_ALLOWLIST_ENFORCE") {
            self.enforce = parse_bool(&enforce)
                .ok_or_else(|| anyhow!("SDK_ALLOWLIST_ENFORCE must be true or false"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.api_level == 0 {
            return Err(anyhow!("api_level must be greater than zero"));
        }
        self.worker_name = self.worker_name.trim().to_string();
        if self.worker_name.is_empty() {
            return Err(anyhow!("worker_name cannot be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<VerifierConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
