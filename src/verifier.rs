//! Symbol-level allowlist decisions.

use serde::Serialize;

use crate::rules::Rule;
use crate::symbol::SymbolReference;
use crate::trie::TokenTrie;

/// Outcome of verifying one compilation unit or a whole module.
///
/// `passed` holds exactly when no restricted usage was found.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    passed: bool,
    restricted_usages: Vec<String>,
}

impl VerificationResult {
    pub fn from_usages(restricted_usages: Vec<String>) -> Self {
        Self {
            passed: restricted_usages.is_empty(),
            restricted_usages,
        }
    }

    pub fn pass() -> Self {
        Self::from_usages(Vec::new())
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn restricted_usages(&self) -> &[String] {
        &self.restricted_usages
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SymbolVerifier;

impl SymbolVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Checks every symbol against `trie`, collecting all denied usages.
    ///
    /// Symbols no rule matches are treated as the module's own code and
    /// allowed.
    pub fn verify<'a, I>(&self, symbols: I, trie: &TokenTrie<Rule>) -> VerificationResult
    where
        I: IntoIterator<Item = &'a SymbolReference>,
    {
        let mut restricted = Vec::new();
        for symbol in symbols {
            match trie.retrieve(&symbol.tokens(), None) {
                Ok(Some(rule)) if !rule.allow => {
                    log::debug!("restricted usage {} (matched {})", symbol, rule);
                    restricted.push(symbol.to_string());
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("cannot evaluate symbol {}: {}", symbol, err);
                    restricted.push(symbol.to_string());
                }
            }
        }
        VerificationResult::from_usages(restricted)
    }
}
