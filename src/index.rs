//! Per-API-level allowlist tries.
//!
//! Each level's trie is built once, on first request, and shared read-only
//! afterwards. Concurrent first requests for the same level wait on a single
//! build; different levels build independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;

use crate::rules::{compile_tokens, default_deny_rules, Rule, RuleSetSource};
use crate::trie::TokenTrie;

type LevelCell = Arc<OnceCell<Arc<TokenTrie<Rule>>>>;

pub struct AllowlistIndex {
    source: Arc<dyn RuleSetSource>,
    levels: Mutex<HashMap<u32, LevelCell>>,
}

impl AllowlistIndex {
    pub fn new(source: Arc<dyn RuleSetSource>) -> Self {
        Self {
            source,
            levels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the trie for `api_level`, building it on first use.
    ///
    /// A rule source failure is returned and nothing is cached, so a later
    /// call retries the build.
    pub fn for_api_level(&self, api_level: u32) -> Result<Arc<TokenTrie<Rule>>> {
        let cell = self.cell(api_level)?;
        let trie = cell.get_or_try_init(|| self.build(api_level).map(Arc::new))?;
        Ok(Arc::clone(trie))
    }

    /// Rebuilds the trie for `api_level` and swaps it in.
    ///
    /// Callers already holding the previous trie keep using it unchanged.
    pub fn reload(&self, api_level: u32) -> Result<Arc<TokenTrie<Rule>>> {
        let trie = Arc::new(self.build(api_level)?);
        let cell = OnceCell::with_value(Arc::clone(&trie));
        self.levels
            .lock()
            .map_err(|_| anyhow!("allowlist index lock poisoned"))?
            .insert(api_level, Arc::new(cell));
        log::info!("api level {}: allowlist reloaded", api_level);
        Ok(trie)
    }

    /// API levels whose trie has finished building.
    pub fn cached_levels(&self) -> Result<Vec<u32>> {
        let levels = self
            .levels
            .lock()
            .map_err(|_| anyhow!("allowlist index lock poisoned"))?;
        let mut built: Vec<u32> = levels
            .iter()
            .filter(|(_, cell)| cell.get().is_some())
            .map(|(level, _)| *level)
            .collect();
        built.sort_unstable();
        Ok(built)
    }

    fn cell(&self, api_level: u32) -> Result<LevelCell> {
        let mut levels = self
            .levels
            .lock()
            .map_err(|_| anyhow!("allowlist index lock poisoned"))?;
        Ok(Arc::clone(levels.entry(api_level).or_default()))
    }

    fn build(&self, api_level: u32) -> Result<TokenTrie<Rule>> {
        let rules = self.source.load_rules(api_level)?;
        if rules.is_none() {
            log::warn!(
                "api level {}: no allowlist found, only default deny rules apply",
                api_level
            );
        }
        build_trie(api_level, rules.unwrap_or_default())
    }
}

/// Builds a trie from the default deny rules followed by `rules`.
///
/// Later rules replace earlier ones compiled to the same key. Malformed
/// rules are logged and skipped.
pub fn build_trie(api_level: u32, rules: Vec<Rule>) -> Result<TokenTrie<Rule>> {
    let mut trie = TokenTrie::new();
    let mut skipped = 0usize;
    for rule in default_deny_rules().into_iter().chain(rules) {
        let tokens = match compile_tokens(&rule) {
            Ok(tokens) => tokens,
            Err(err) => {
                log::warn!("api level {}: skipping {}", api_level, err);
                skipped += 1;
                continue;
            }
        };
        if let Some(previous) = trie.put(rule, &tokens)? {
            log::debug!("api level {}: replaced {}", api_level, previous);
        }
    }
    log::info!(
        "api level {}: allowlist built with {} keys ({} malformed rules skipped)",
        api_level,
        trie.len(),
        skipped
    );
    Ok(trie)
}
