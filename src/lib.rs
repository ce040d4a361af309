//! SDK allowlist verification engine
//!
//! This crate decides whether an untrusted SDK module may be loaded into the
//! sandbox by checking every external class member it references against a
//! per-API-level allow/deny rule set.
//!
//! # Architecture
//!
//! The engine enforces four invariants:
//!
//! 1. **Most Specific Rule Wins**: Exact tokens beat wildcards at every level of the trie.
//! 2. **Platform Denied By Default**: Platform namespaces are denied unless a rule allows them.
//! 3. **Bad Rules Never Load**: A malformed rule is skipped, never inserted.
//! 4. **Bounded Verification**: One compilation unit in memory at a time; the first failing unit ends the run.
//!
//! # Module Structure
//!
//! - `trie`: Wildcard token trie (Token, TokenTrie)
//! - `rules`: Rules, key compilation, rule-set file format and sources
//! - `index`: Per-API-level trie cache (AllowlistIndex)
//! - `symbol`, `verifier`: Symbol references and per-unit decisions
//! - `package`, `pipeline`, `worker`: Symbol sources, sequential pipeline, dedicated worker
//! - `config`: Host configuration

pub mod config;
pub mod index;
pub mod package;
pub mod pipeline;
pub mod rules;
pub mod symbol;
pub mod trie;
pub mod verifier;
pub mod worker;

pub use index::{build_trie, AllowlistIndex};
pub use package::{
    InMemorySymbolSource, ManifestSymbolSource, ModulePackage, PackageFile, SymbolSource, UnitId,
};
pub use pipeline::{PipelineError, PipelineState, SequentialVerificationPipeline};
pub use rules::{
    compile_tokens, default_deny_rules, FileRuleSetSource, InMemoryRuleSetSource, MalformedRule,
    Rule, RuleSetFile, RuleSetSource,
};
pub use symbol::{SymbolReference, SymbolTable};
pub use trie::{Token, TokenTrie, TrieError};
pub use verifier::{SymbolVerifier, VerificationResult};
pub use worker::{VerificationCallback, VerificationWorker};
