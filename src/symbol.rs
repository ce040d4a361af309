use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rules::CLASS_SEPARATOR;

/// Separator between fields of a method signature (`name;params...;return`).
pub const SIGNATURE_SEPARATOR: char = ';';

/// One call-site reference to an external class member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolReference {
    pub referenced_class: String,
    pub referenced_method_signature: String,
}

impl SymbolReference {
    pub fn new(referenced_class: &str, referenced_method_signature: &str) -> Self {
        Self {
            referenced_class: referenced_class.to_string(),
            referenced_method_signature: referenced_method_signature.to_string(),
        }
    }

    /// Trie query tokens: class segments followed by signature fields.
    pub fn tokens(&self) -> Vec<&str> {
        self.referenced_class
            .split(CLASS_SEPARATOR)
            .chain(self.referenced_method_signature.split(SIGNATURE_SEPARATOR))
            .collect()
    }
}

impl fmt::Display for SymbolReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}",
            self.referenced_class, self.referenced_method_signature
        )
    }
}

/// Symbols referenced by one compilation unit, in call-site order.
pub type SymbolTable = Vec<SymbolReference>;
