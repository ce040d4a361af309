//! Wildcard-capable token trie.
//!
//! Keys are sequences of [`Token`]s. A [`Token::Wildcard`] absorbs a run of
//! zero or more query tokens. Lookups are depth-first and explore the exact
//! child before the wildcard child at every level, so the most specific
//! stored key wins without explicit priorities.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// One position in a trie key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Token {
    Literal(String),
    Wildcard,
}

impl Token {
    pub fn literal(value: impl Into<String>) -> Self {
        Token::Literal(value.into())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Token::Wildcard)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Literal(value) => f.write_str(value),
            Token::Wildcard => f.write_str("*"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrieError {
    #[error("token trie key must contain at least one token")]
    EmptyKey,
}

#[derive(Debug)]
struct TrieNode<V> {
    value: Option<V>,
    children: BTreeMap<String, TrieNode<V>>,
    wildcard: Option<Box<TrieNode<V>>>,
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
            wildcard: None,
        }
    }
}

impl<V> TrieNode<V> {
    fn lookup<S: AsRef<str>>(
        &self,
        keys: &[S],
        mut captures: Option<&mut Vec<String>>,
    ) -> Option<&V> {
        match keys.split_first() {
            None => {
                if self.value.is_some() {
                    return self.value.as_ref();
                }
            }
            Some((head, rest)) => {
                if let Some(child) = self.children.get(head.as_ref()) {
                    if let Some(value) = child.lookup(rest, captures.as_deref_mut()) {
                        return Some(value);
                    }
                }
            }
        }

        let wildcard = self.wildcard.as_deref()?;
        // Shortest run first: a more specific sibling below the wildcard
        // gets the chance to consume the next tokens literally.
        for taken in 0..=keys.len() {
            let mark = captures.as_ref().map(|c| c.len());
            if let Some(c) = captures.as_deref_mut() {
                c.push(join_tokens(&keys[..taken]));
            }
            if let Some(value) = wildcard.lookup(&keys[taken..], captures.as_deref_mut()) {
                return Some(value);
            }
            if let (Some(c), Some(mark)) = (captures.as_deref_mut(), mark) {
                c.truncate(mark);
            }
        }
        None
    }

    fn collect<'a>(&'a self, prefix: &mut Vec<Token>, out: &mut Vec<(Vec<Token>, &'a V)>) {
        if let Some(value) = &self.value {
            out.push((prefix.clone(), value));
        }
        for (literal, child) in &self.children {
            prefix.push(Token::Literal(literal.clone()));
            child.collect(prefix, out);
            prefix.pop();
        }
        if let Some(child) = &self.wildcard {
            prefix.push(Token::Wildcard);
            child.collect(prefix, out);
            prefix.pop();
        }
    }
}

fn join_tokens<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| t.as_ref())
        .collect::<Vec<_>>()
        .join("/")
}

/// Maps token sequences to values, with most-specific-match lookup.
#[derive(Debug)]
pub struct TokenTrie<V> {
    root: TrieNode<V>,
    len: usize,
}

impl<V> Default for TokenTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TokenTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
            len: 0,
        }
    }

    /// Stores `value` at `keys`, returning the value it replaced.
    pub fn put(&mut self, value: V, keys: &[Token]) -> Result<Option<V>, TrieError> {
        if keys.is_empty() {
            return Err(TrieError::EmptyKey);
        }
        let mut node = &mut self.root;
        for token in keys {
            node = match token {
                Token::Literal(literal) => node.children.entry(literal.clone()).or_default(),
                Token::Wildcard => &mut **node.wildcard.get_or_insert_with(Box::default),
            };
        }
        let previous = node.value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        Ok(previous)
    }

    /// Finds the most specific value matching `keys`.
    ///
    /// When `captures` is supplied, each wildcard on the winning path pushes
    /// the tokens it absorbed, joined with `/` (empty for a zero-width match).
    pub fn retrieve<S: AsRef<str>>(
        &self,
        keys: &[S],
        captures: Option<&mut Vec<String>>,
    ) -> Result<Option<&V>, TrieError> {
        if keys.is_empty() {
            return Err(TrieError::EmptyKey);
        }
        Ok(self.root.lookup(keys, captures))
    }

    pub fn clear(&mut self) {
        self.root = TrieNode::default();
        self.len = 0;
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every stored key and value, literals in lexical order before the wildcard.
    pub fn entries(&self) -> Vec<(Vec<Token>, &V)> {
        let mut out = Vec::with_capacity(self.len);
        self.root.collect(&mut Vec::new(), &mut out);
        out
    }
}
