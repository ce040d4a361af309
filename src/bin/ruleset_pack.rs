//! ruleset_pack - encode a JSON allowlist listing into the binary rule-set format
//!
//! Input shape:
//! `{"levels": {"34": [{"class_name": "Landroid/util/Log", "allow": true}, ...]}}`

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;

use sdk_allowlist::{compile_tokens, Rule, RuleSetFile};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON rule listing to encode.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Output path for the encoded rule set.
    #[arg(long, default_value = "allowlist.bin", value_name = "PATH")]
    output: PathBuf,
    /// Drop rules that fail key compilation instead of failing the pack.
    #[arg(long)]
    allow_malformed: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleListing {
    levels: BTreeMap<u32, Vec<Rule>>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(ui::UiMode::parse(&args.ui), is_tty, !stdout_is_tty);

    let listing: RuleListing = {
        let _stage = ui.stage("Read rule listing");
        let raw = std::fs::read_to_string(&args.input)
            .with_context(|| format!("failed to read {}", args.input.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid rule listing {}", args.input.display()))?
    };

    let mut file = RuleSetFile::new();
    {
        let _stage = ui.stage("Check rules");
        let mut malformed = 0usize;
        for (level, rules) in listing.levels {
            let mut kept = Vec::with_capacity(rules.len());
            for rule in rules {
                match compile_tokens(&rule) {
                    Ok(_) => kept.push(rule),
                    Err(err) => {
                        log::warn!("api level {}: {}", level, err);
                        malformed += 1;
                    }
                }
            }
            file.insert_level(level, kept);
        }
        if malformed > 0 {
            if !args.allow_malformed {
                return Err(anyhow!(
                    "{} malformed rules; fix them or pass --allow-malformed",
                    malformed
                ));
            }
            log::warn!("dropped {} malformed rules", malformed);
        }
    }

    let bytes = {
        let _stage = ui.stage("Encode rule set");
        let bytes = file.encode()?;
        std::fs::write(&args.output, &bytes)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        bytes
    };

    println!(
        "ruleset_pack: wrote {} ({} api levels, {} bytes, sha256 {})",
        args.output.display(),
        file.levels.len(),
        bytes.len(),
        hex::encode(RuleSetFile::digest(&bytes))
    );
    Ok(())
}
