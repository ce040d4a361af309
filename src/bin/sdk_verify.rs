//! sdk_verify - Check an SDK module's symbol manifests against the platform allowlist
//!
//! This tool:
//! 1. Loads the encoded rule set and builds the allowlist for one API level
//! 2. Verifies the module's compilation units one at a time, in order, on
//!    the configured worker thread
//! 3. Stops at the first unit that references a restricted API
//!
//! Exit status is non-zero when the module is denied (with enforcement on)
//! or when verification could not be completed.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use sdk_allowlist::config::VerifierConfig;
use sdk_allowlist::{
    AllowlistIndex, FileRuleSetSource, ManifestSymbolSource, ModulePackage, PackageFile,
    PipelineState, SequentialVerificationPipeline, VerificationWorker,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "sdk_verify",
    about = "Verify an SDK module against the platform API allowlist"
)]
struct Args {
    /// Encoded rule set file (overrides config / SDK_ALLOWLIST_RULES_PATH)
    #[arg(long, value_name = "PATH")]
    rules: Option<PathBuf>,

    /// Target API level whose allowlist applies
    #[arg(long)]
    api_level: Option<u32>,

    /// Module name used in reports
    #[arg(long, default_value = "sdk")]
    module: String,

    /// Symbol manifest of one package file; repeat for split packages, in load order
    #[arg(long = "package", value_name = "PATH", required = true)]
    packages: Vec<PathBuf>,

    /// Report restricted usages without failing
    #[arg(long)]
    report_only: bool,

    /// Print the verdict as JSON on stdout
    #[arg(long)]
    json: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(ui::UiMode::parse(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = VerifierConfig::load()?;
    if let Some(rules) = args.rules.clone() {
        cfg.rules_path = rules;
    }
    if let Some(level) = args.api_level {
        if level == 0 {
            return Err(anyhow!("--api-level must be greater than zero"));
        }
        cfg.api_level = level;
    }
    if args.report_only {
        cfg.enforce = false;
    }

    let rules = {
        let _stage = ui.stage("Load rule set");
        FileRuleSetSource::open(&cfg.rules_path)?
    };
    let digest = rules.digest_hex();
    let index = Arc::new(AllowlistIndex::new(Arc::new(rules)));
    {
        let _stage = ui.stage("Build allowlist");
        index.for_api_level(cfg.api_level)?;
    }

    let module = ModulePackage::new(
        &args.module,
        args.packages.iter().map(|p| PackageFile::new(p.clone())).collect(),
    );
    let counter = ui.unit_counter();
    let ticker = counter.clone();
    let pipeline = SequentialVerificationPipeline::new(ManifestSymbolSource::new())
        .with_transition_hook(move |state| {
            if state == PipelineState::Verifying {
                ticker.tick();
            }
        });
    let worker = VerificationWorker::with_pipeline(&cfg.worker_name, Arc::clone(&index), pipeline)?;
    let outcome = {
        let _stage = ui.stage("Verify compilation units");
        worker.verify_module_blocking(module.clone(), cfg.api_level)
    };
    worker.shutdown()?;
    let units = counter.finish();
    let result = outcome.context("verification could not be completed")?;

    if args.json {
        let report = serde_json::json!({
            "module": module.name,
            "api_level": cfg.api_level,
            "rules_sha256": digest,
            "units_verified": units,
            "passed": result.passed(),
            "enforced": cfg.enforce,
            "restricted_usages": result.restricted_usages(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "sdk_verify: module {} against api level {} (rules sha256 {})",
            module.name,
            cfg.api_level,
            &digest[..16]
        );
        println!("verified {} compilation units", units);
        if result.passed() {
            println!("PASS: no restricted api usage");
        } else {
            println!(
                "FAIL: {} restricted api usages",
                result.restricted_usages().len()
            );
            for usage in result.restricted_usages() {
                println!("  {}", usage);
            }
        }
    }

    if !result.passed() {
        if cfg.enforce {
            return Err(anyhow!(
                "module {} denied: references restricted platform apis",
                module.name
            ));
        }
        log::warn!(
            "module {} references restricted apis; enforcement is off",
            module.name
        );
    }
    Ok(())
}
