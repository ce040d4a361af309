//! Sequential, one-unit-at-a-time verification of a module.
//!
//! All compilation units of every package file are enumerated first. Units
//! are then loaded and verified strictly in that order, holding a single
//! symbol table at a time. The first failing unit ends the run; later units
//! are never loaded.

use thiserror::Error;

use crate::package::{ModulePackage, PackageFile, SymbolSource, UnitId};
use crate::rules::Rule;
use crate::trie::TokenTrie;
use crate::verifier::{SymbolVerifier, VerificationResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    LoadingUnit,
    Verifying,
    Completed { passed: bool },
    Failed,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to enumerate compilation units of {package}")]
    Enumerate {
        package: PackageFile,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to load compilation unit {unit} of {package}")]
    Load {
        package: PackageFile,
        unit: UnitId,
        #[source]
        source: anyhow::Error,
    },
}

type TransitionHook = Box<dyn FnMut(PipelineState) + Send>;

pub struct SequentialVerificationPipeline<S> {
    source: S,
    verifier: SymbolVerifier,
    state: PipelineState,
    on_transition: Option<TransitionHook>,
}

impl<S: SymbolSource> SequentialVerificationPipeline<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            verifier: SymbolVerifier::new(),
            state: PipelineState::Idle,
            on_transition: None,
        }
    }

    /// Calls `hook` on every state change.
    pub fn with_transition_hook(mut self, hook: impl FnMut(PipelineState) + Send + 'static) -> Self {
        self.on_transition = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Verifies `module` against `trie`.
    ///
    /// A restricted usage is a completed run with `passed() == false`, not an
    /// error. Errors are reserved for units that could not be listed or read.
    pub fn run(
        &mut self,
        module: &ModulePackage,
        trie: &TokenTrie<Rule>,
    ) -> Result<VerificationResult, PipelineError> {
        self.transition(PipelineState::Idle);

        let units = match self.enumerate(module) {
            Ok(units) => units,
            Err(err) => {
                log::warn!("module {}: {}", module.name, err);
                self.transition(PipelineState::Failed);
                return Err(err);
            }
        };
        log::debug!(
            "module {}: {} compilation units across {} package files",
            module.name,
            units.len(),
            module.files.len()
        );

        for (package, unit) in units {
            self.transition(PipelineState::LoadingUnit);
            let symbols = match self.source.load_symbols(&package, &unit) {
                Ok(symbols) => symbols,
                Err(source) => {
                    let err = PipelineError::Load {
                        package,
                        unit,
                        source,
                    };
                    log::warn!("module {}: {}", module.name, err);
                    self.transition(PipelineState::Failed);
                    return Err(err);
                }
            };

            self.transition(PipelineState::Verifying);
            let result = self.verifier.verify(&symbols, trie);
            drop(symbols);
            if !result.passed() {
                log::info!(
                    "module {}: unit {} of {} uses {} restricted apis",
                    module.name,
                    unit,
                    package,
                    result.restricted_usages().len()
                );
                self.transition(PipelineState::Completed { passed: false });
                return Ok(result);
            }
        }

        log::info!("module {}: verification passed", module.name);
        self.transition(PipelineState::Completed { passed: true });
        Ok(VerificationResult::pass())
    }

    fn enumerate(&self, module: &ModulePackage) -> Result<Vec<(PackageFile, UnitId)>, PipelineError> {
        let mut units = Vec::new();
        for package in &module.files {
            let listed = self
                .source
                .list_compilation_units(package)
                .map_err(|source| PipelineError::Enumerate {
                    package: package.clone(),
                    source,
                })?;
            units.extend(listed.into_iter().map(|unit| (package.clone(), unit)));
        }
        Ok(units)
    }

    fn transition(&mut self, next: PipelineState) {
        self.state = next;
        if let Some(hook) = self.on_transition.as_mut() {
            hook(next);
        }
    }
}
