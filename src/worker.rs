//! Dedicated verification thread.
//!
//! A worker owns one pipeline and a job queue. Submitted modules are
//! verified one after another; every submission settles exactly one
//! callback.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, SendError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};

use crate::index::AllowlistIndex;
use crate::package::{ModulePackage, SymbolSource};
use crate::pipeline::SequentialVerificationPipeline;
use crate::verifier::VerificationResult;

/// Receives the outcome of one module verification.
///
/// Both methods consume the callback, so at most one of them can run.
pub trait VerificationCallback: Send {
    fn on_result(self: Box<Self>, module: &str, result: VerificationResult);

    fn on_error(self: Box<Self>, module: &str, error: anyhow::Error);
}

impl<F> VerificationCallback for F
where
    F: FnOnce(Result<VerificationResult>) + Send,
{
    fn on_result(self: Box<Self>, _module: &str, result: VerificationResult) {
        (*self)(Ok(result))
    }

    fn on_error(self: Box<Self>, _module: &str, error: anyhow::Error) {
        (*self)(Err(error))
    }
}

struct Job {
    module: ModulePackage,
    api_level: u32,
    callback: Box<dyn VerificationCallback>,
}

pub struct VerificationWorker {
    name: String,
    jobs: Option<Sender<Job>>,
    join: Option<JoinHandle<()>>,
}

impl VerificationWorker {
    pub fn spawn<S>(name: &str, index: Arc<AllowlistIndex>, source: S) -> Result<Self>
    where
        S: SymbolSource + 'static,
    {
        Self::with_pipeline(name, index, SequentialVerificationPipeline::new(source))
    }

    /// Runs jobs through `pipeline`, keeping any transition hook it carries.
    ///
    /// A panic while verifying one module is reported to that module's
    /// callback; the worker then moves on to the next queued job.
    pub fn with_pipeline<S>(
        name: &str,
        index: Arc<AllowlistIndex>,
        mut pipeline: SequentialVerificationPipeline<S>,
    ) -> Result<Self>
    where
        S: SymbolSource + 'static,
    {
        let (tx, rx) = mpsc::channel::<Job>();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    let Job {
                        module,
                        api_level,
                        callback,
                    } = job;
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        verify_job(&index, &mut pipeline, &module, api_level)
                    }))
                    .unwrap_or_else(|payload| {
                        let err = anyhow!(
                            "verification of module {} panicked: {}",
                            module.name,
                            panic_message(payload.as_ref())
                        );
                        log::error!("{}", err);
                        Err(err)
                    });
                    let settled = panic::catch_unwind(AssertUnwindSafe(|| match outcome {
                        Ok(result) => callback.on_result(&module.name, result),
                        Err(err) => callback.on_error(&module.name, err),
                    }));
                    if settled.is_err() {
                        log::error!("module {}: verification callback panicked", module.name);
                    }
                }
                log::debug!("verification worker stopped");
            })?;
        log::debug!("verification worker {} started", name);
        Ok(Self {
            name: name.to_string(),
            jobs: Some(tx),
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `module` for verification against the rules of `api_level`.
    ///
    /// If the worker has stopped, `callback` receives the error immediately.
    pub fn verify_module<C>(&self, module: ModulePackage, api_level: u32, callback: C)
    where
        C: VerificationCallback + 'static,
    {
        let job = Job {
            module,
            api_level,
            callback: Box::new(callback),
        };
        let Some(jobs) = self.jobs.as_ref() else {
            job.callback
                .on_error(&job.module.name, anyhow!("verification worker {} is shut down", self.name));
            return;
        };
        if let Err(SendError(job)) = jobs.send(job) {
            job.callback
                .on_error(&job.module.name, anyhow!("verification worker {} has stopped", self.name));
        }
    }

    /// Blocks until `module` has been verified.
    pub fn verify_module_blocking(
        &self,
        module: ModulePackage,
        api_level: u32,
    ) -> Result<VerificationResult> {
        let (tx, rx) = mpsc::channel();
        self.verify_module(module, api_level, move |outcome: Result<VerificationResult>| {
            let _ = tx.send(outcome);
        });
        rx.recv()
            .map_err(|_| anyhow!("verification worker {} dropped the request", self.name))?
    }

    /// Finishes queued jobs and joins the thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.jobs.take();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("verification worker {} panicked", self.name))?;
        }
        Ok(())
    }
}

fn verify_job<S: SymbolSource>(
    index: &AllowlistIndex,
    pipeline: &mut SequentialVerificationPipeline<S>,
    module: &ModulePackage,
    api_level: u32,
) -> Result<VerificationResult> {
    let trie = index.for_api_level(api_level).map_err(|err| {
        log::error!(
            "module {}: allowlist for api level {} unavailable: {:#}",
            module.name,
            api_level,
            err
        );
        err
    })?;
    Ok(pipeline.run(module, &trie)?)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

impl Drop for VerificationWorker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("{}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{InMemorySymbolSource, PackageFile, UnitId};
    use crate::rules::{InMemoryRuleSetSource, Rule, RuleSetSource};
    use crate::symbol::{SymbolReference, SymbolTable};
    use std::sync::Mutex;

    fn index() -> Arc<AllowlistIndex> {
        let source = InMemoryRuleSetSource::new().with_level(
            34,
            vec![Rule::deny("Lcom/x/Api").method("foo").returns("V")],
        );
        Arc::new(AllowlistIndex::new(Arc::new(source)))
    }

    struct Recorder {
        outcomes: Arc<Mutex<Vec<String>>>,
    }

    impl VerificationCallback for Recorder {
        fn on_result(self: Box<Self>, module: &str, result: VerificationResult) {
            self.outcomes
                .lock()
                .unwrap()
                .push(format!("{module}: passed={}", result.passed()));
        }

        fn on_error(self: Box<Self>, module: &str, error: anyhow::Error) {
            self.outcomes
                .lock()
                .unwrap()
                .push(format!("{module}: error {error}"));
        }
    }

    #[test]
    fn jobs_settle_exactly_one_callback_in_submission_order() {
        let good = PackageFile::new("good.apk");
        let bad = PackageFile::new("bad.apk");
        let broken = PackageFile::new("broken.apk");
        let source = InMemorySymbolSource::new()
            .with_unit(&good, "classes.dex", vec![SymbolReference::new("Lcom/a/B", "c;V")])
            .with_unit(&bad, "classes.dex", vec![SymbolReference::new("Lcom/x/Api", "foo;V")])
            .with_unreadable_package(&broken, "bad zip");

        let worker = VerificationWorker::spawn("verifier-test", index(), source).unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        for (name, file) in [("good", &good), ("bad", &bad), ("broken", &broken)] {
            worker.verify_module(
                ModulePackage::new(name, vec![file.clone()]),
                34,
                Recorder {
                    outcomes: Arc::clone(&outcomes),
                },
            );
        }
        worker.shutdown().unwrap();

        let outcomes = outcomes.lock().unwrap().clone();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0], "good: passed=true");
        assert_eq!(outcomes[1], "bad: passed=false");
        assert!(outcomes[2].starts_with("broken: error"), "{}", outcomes[2]);
    }

    #[test]
    fn blocking_helper_returns_verdict() {
        let base = PackageFile::new("base.apk");
        let source = InMemorySymbolSource::new().with_unit(
            &base,
            "classes.dex",
            vec![SymbolReference::new("Ljava/lang/Runtime", "exec;Ljava/lang/String;Ljava/lang/Process")],
        );
        let worker = VerificationWorker::spawn("verifier-test", index(), source).unwrap();

        let result = worker
            .verify_module_blocking(ModulePackage::new("sdk", vec![base]), 34)
            .unwrap();
        assert!(!result.passed());
    }

    struct PanickingSource {
        inner: InMemorySymbolSource,
        poisoned: PackageFile,
    }

    impl SymbolSource for PanickingSource {
        fn list_compilation_units(&self, package: &PackageFile) -> Result<Vec<UnitId>> {
            if *package == self.poisoned {
                panic!("container parser crashed on {}", package);
            }
            self.inner.list_compilation_units(package)
        }

        fn load_symbols(&self, package: &PackageFile, unit: &UnitId) -> Result<SymbolTable> {
            self.inner.load_symbols(package, unit)
        }
    }

    #[test]
    fn panicking_job_settles_its_callback_and_worker_keeps_going() {
        let boom = PackageFile::new("boom.apk");
        let next = PackageFile::new("next.apk");
        let source = PanickingSource {
            inner: InMemorySymbolSource::new().with_unit(
                &next,
                "classes.dex",
                vec![SymbolReference::new("Lcom/a/B", "c;V")],
            ),
            poisoned: boom.clone(),
        };

        let worker = VerificationWorker::spawn("verifier-test", index(), source).unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        for (name, file) in [("boom", &boom), ("next", &next)] {
            worker.verify_module(
                ModulePackage::new(name, vec![file.clone()]),
                34,
                Recorder {
                    outcomes: Arc::clone(&outcomes),
                },
            );
        }
        worker.shutdown().unwrap();

        let outcomes = outcomes.lock().unwrap().clone();
        assert_eq!(outcomes.len(), 2, "{outcomes:?}");
        assert!(outcomes[0].starts_with("boom: error"), "{}", outcomes[0]);
        assert!(outcomes[0].contains("container parser crashed"), "{}", outcomes[0]);
        assert_eq!(outcomes[1], "next: passed=true");
    }

    #[test]
    fn custom_pipeline_runs_on_named_thread() {
        let base = PackageFile::new("base.apk");
        let source = InMemorySymbolSource::new().with_unit(
            &base,
            "classes.dex",
            vec![SymbolReference::new("Lcom/a/B", "c;V")],
        );
        let threads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&threads);
        let pipeline = SequentialVerificationPipeline::new(source).with_transition_hook(move |_| {
            let name = std::thread::current().name().map(str::to_string);
            sink.lock().unwrap().push(name);
        });
        let worker = VerificationWorker::with_pipeline("sdk-verifier-bg", index(), pipeline).unwrap();
        assert_eq!(worker.name(), "sdk-verifier-bg");

        let result = worker
            .verify_module_blocking(ModulePackage::new("sdk", vec![base]), 34)
            .unwrap();
        assert!(result.passed());
        worker.shutdown().unwrap();

        let threads = threads.lock().unwrap();
        assert!(!threads.is_empty());
        assert!(threads
            .iter()
            .all(|name| name.as_deref() == Some("sdk-verifier-bg")));
    }

    #[test]
    fn index_failure_goes_to_error_callback() {
        struct Broken;
        impl RuleSetSource for Broken {
            fn load_rules(&self, _api_level: u32) -> Result<Option<Vec<Rule>>> {
                Err(anyhow!("rule store offline"))
            }
        }
        let index = Arc::new(AllowlistIndex::new(Arc::new(Broken)));
        let worker =
            VerificationWorker::spawn("verifier-test", index, InMemorySymbolSource::new()).unwrap();

        let err = worker
            .verify_module_blocking(ModulePackage::new("sdk", Vec::new()), 34)
            .unwrap_err();
        assert!(err.to_string().contains("rule store offline"), "{err}");
    }
}
