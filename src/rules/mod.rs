//! Allowlist rules and their compilation into trie keys.
//!
//! A rule names a class, method, parameter list and return type. Any field
//! left out matches anything at that position. Compilation emits the fields
//! in that fixed order and never places two wildcards next to each other.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trie::Token;

pub mod format;
pub mod source;

pub use format::{RuleSetFile, RULESET_FORMAT_VERSION, RULESET_MAGIC};
pub use source::{FileRuleSetSource, InMemoryRuleSetSource, RuleSetSource};

/// Separator between class name segments in a type descriptor.
pub const CLASS_SEPARATOR: char = '/';

/// Platform namespaces denied before any level-specific rule is applied.
pub const DEFAULT_DENY_NAMESPACES: &[&str] = &[
    "Landroid",
    "Lcom/android",
    "Ldalvik",
    "Ljava",
    "Ljavax",
];

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub method_name: Option<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub return_type: Option<String>,
    pub allow: bool,
}

impl Rule {
    pub fn allow(class_name: &str) -> Self {
        Self::new(class_name, true)
    }

    pub fn deny(class_name: &str) -> Self {
        Self::new(class_name, false)
    }

    fn new(class_name: &str, allow: bool) -> Self {
        Self {
            class_name: Some(class_name.to_string()),
            method_name: None,
            parameters: Vec::new(),
            return_type: None,
            allow,
        }
    }

    /// A rule with no class name, matching any class.
    pub fn any_class(allow: bool) -> Self {
        Self {
            class_name: None,
            method_name: None,
            parameters: Vec::new(),
            return_type: None,
            allow,
        }
    }

    pub fn method(mut self, name: &str) -> Self {
        self.method_name = Some(name.to_string());
        self
    }

    pub fn params(mut self, params: &[&str]) -> Self {
        self.parameters = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn returns(mut self, return_type: &str) -> Self {
        self.return_type = Some(return_type.to_string());
        self
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = if self.parameters.is_empty() {
            "*".to_string()
        } else {
            self.parameters.join(";")
        };
        write!(
            f,
            "{}->{};{};{} ({})",
            self.class_name.as_deref().unwrap_or("*"),
            self.method_name.as_deref().unwrap_or("*"),
            params,
            self.return_type.as_deref().unwrap_or("*"),
            if self.allow { "allow" } else { "deny" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed rule {rule}: {reason}")]
pub struct MalformedRule {
    pub rule: String,
    pub reason: String,
}

/// Deny rules for every entry of [`DEFAULT_DENY_NAMESPACES`].
pub fn default_deny_rules() -> Vec<Rule> {
    DEFAULT_DENY_NAMESPACES
        .iter()
        .map(|namespace| Rule::deny(namespace))
        .collect()
}

struct KeyBuilder {
    tokens: Vec<Token>,
}

impl KeyBuilder {
    fn literal(&mut self, value: &str) {
        self.tokens.push(Token::literal(value));
    }

    fn wildcard(&mut self) {
        if !matches!(self.tokens.last(), Some(Token::Wildcard)) {
            self.tokens.push(Token::Wildcard);
        }
    }
}

/// Compiles a rule into its trie key.
pub fn compile_tokens(rule: &Rule) -> Result<Vec<Token>, MalformedRule> {
    let mut key = KeyBuilder { tokens: Vec::new() };

    match rule.class_name.as_deref() {
        Some(class_name) => class_name
            .split(CLASS_SEPARATOR)
            .for_each(|segment| key.literal(segment)),
        None => key.wildcard(),
    }

    match rule.method_name.as_deref() {
        Some(method) => key.literal(method),
        None => key.wildcard(),
    }

    if rule.parameters.is_empty() {
        key.wildcard();
    } else {
        rule.parameters.iter().for_each(|param| key.literal(param));
    }

    match rule.return_type.as_deref() {
        Some(return_type) => key.literal(return_type),
        None => key.wildcard(),
    }

    let empty_at = key
        .tokens
        .iter()
        .position(|token| matches!(token, Token::Literal(value) if value.is_empty()));
    if let Some(position) = empty_at {
        return Err(MalformedRule {
            rule: rule.to_string(),
            reason: format!("empty token at position {}", position),
        });
    }
    Ok(key.tokens)
}
