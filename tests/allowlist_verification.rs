//! End-to-end allowlist verification tests.
//!
//! Rule sets go through the binary format and the index; modules go
//! through symbol manifests on disk and the sequential pipeline.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tempfile::{tempdir, TempDir};

use sdk_allowlist::{
    build_trie, compile_tokens, AllowlistIndex, FileRuleSetSource, InMemoryRuleSetSource,
    ManifestSymbolSource, ModulePackage, PackageFile, PipelineError, Rule, RuleSetFile,
    SequentialVerificationPipeline, SymbolReference, SymbolVerifier, Token, TokenTrie,
    VerificationWorker,
};

fn write_rule_set(dir: &TempDir, file: &RuleSetFile) -> Result<FileRuleSetSource> {
    let path = dir.path().join("allowlist.bin");
    std::fs::write(&path, file.encode()?)?;
    FileRuleSetSource::open(&path)
}

fn write_manifest(dir: &TempDir, name: &str, units: &[(&str, &[(&str, &str)])]) -> PackageFile {
    let path = dir.path().join(name);
    let mut out = std::fs::File::create(&path).expect("create manifest");
    for (unit, symbols) in units {
        let line = serde_json::json!({ "unit": unit, "symbols": symbols });
        writeln!(out, "{}", line).expect("write manifest");
    }
    PackageFile::new(path)
}

fn platform_rules() -> RuleSetFile {
    let mut file = RuleSetFile::new();
    file.insert_level(
        34,
        vec![
            Rule::allow("Landroid/util/Log"),
            Rule::allow("Ljava/lang/Object"),
            Rule::allow("Ljava/lang/String"),
            Rule::deny("Lcom/x/Api").method("foo").returns("V"),
        ],
    );
    file
}

#[test]
fn exact_path_beats_wildcard_sibling() {
    let mut trie = TokenTrie::new();
    trie.put("namespace", &[Token::literal("Landroid"), Token::Wildcard])
        .unwrap();
    trie.put(
        "exact",
        &[
            Token::literal("Landroid"),
            Token::literal("util"),
            Token::literal("Log"),
        ],
    )
    .unwrap();

    assert_eq!(
        trie.retrieve(&["Landroid", "util", "Log"], None).unwrap(),
        Some(&"exact")
    );
}

#[test]
fn compiled_rule_round_trips_through_trie() {
    let rule = Rule::deny("Lcom/x/Api")
        .method("foo")
        .params(&["I", "Ljava/lang/String"])
        .returns("Z");
    let tokens = compile_tokens(&rule).unwrap();

    let mut trie = TokenTrie::new();
    assert!(trie.put(rule.clone(), &tokens).unwrap().is_none());

    let literal: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    assert_eq!(trie.retrieve(&literal, None).unwrap(), Some(&rule));
}

#[test]
fn malformed_rule_is_never_inserted() {
    let rule = Rule::deny("Landroid//view");
    assert!(compile_tokens(&rule).is_err());

    let trie = build_trie(34, vec![rule.clone()]).unwrap();
    assert!(trie.entries().iter().all(|(_, stored)| **stored != rule));
}

#[test]
fn default_baseline_denies_platform_namespaces_only() {
    let index = AllowlistIndex::new(Arc::new(
        InMemoryRuleSetSource::new().with_level(34, Vec::new()),
    ));
    let trie = index.for_api_level(34).unwrap();
    let verifier = SymbolVerifier::new();

    for class in [
        "Landroid/app/Activity",
        "Lcom/android/internal/R",
        "Ldalvik/system/DexClassLoader",
        "Ljava/lang/Runtime",
        "Ljavax/crypto/Cipher",
    ] {
        let symbols = [SymbolReference::new(class, "m;V")];
        let result = verifier.verify(&symbols, &trie);
        assert!(!result.passed(), "{class} should be denied");
    }

    let own = [
        SymbolReference::new("Lcom/example/sdk/Banner", "show;V"),
        SymbolReference::new("Lcom/androidx/Fake", "m;V"),
    ];
    assert!(verifier.verify(&own, &trie).passed());
}

#[test]
fn documented_scenario_reports_single_usage() {
    let trie = build_trie(
        34,
        vec![Rule::deny("Lcom/x/Api").method("foo").returns("V")],
    )
    .unwrap();
    let symbols = [SymbolReference::new("Lcom/x/Api", "foo;V")];

    let result = SymbolVerifier::new().verify(&symbols, &trie);
    assert!(!result.passed());
    assert_eq!(result.restricted_usages(), ["Lcom/x/Api->foo;V"]);
}

#[test]
fn manifests_verify_against_file_rule_set() -> Result<()> {
    let dir = tempdir()?;
    let rules = write_rule_set(&dir, &platform_rules())?;
    let index = AllowlistIndex::new(Arc::new(rules));
    let trie = index.for_api_level(34)?;

    let base = write_manifest(
        &dir,
        "base.jsonl",
        &[(
            "classes.dex",
            &[
                ("Landroid/util/Log", "d;Ljava/lang/String;Ljava/lang/String;I"),
                ("Ljava/lang/Object", "<init>;V"),
                ("Lcom/example/sdk/Ads", "load;V"),
            ],
        )],
    );
    let split = write_manifest(
        &dir,
        "split.jsonl",
        &[("classes.dex", &[("Ljava/lang/String", "length;I")])],
    );

    let mut pipeline = SequentialVerificationPipeline::new(ManifestSymbolSource::new());
    let result = pipeline.run(&ModulePackage::new("com.example.sdk", vec![base, split]), &trie)?;
    assert!(result.passed());
    Ok(())
}

#[test]
fn short_circuit_never_reads_later_units() -> Result<()> {
    let dir = tempdir()?;
    let index = AllowlistIndex::new(Arc::new(write_rule_set(&dir, &platform_rules())?));
    let trie = index.for_api_level(34)?;

    // Every unit header is read before any unit is loaded.
    let path = dir.path().join("base.jsonl");
    std::fs::write(
        &path,
        concat!(
            r#"{"unit": "A", "symbols": [["Lcom/example/Own", "run;V"]]}"#,
            "\n",
            r#"{"unit": "B", "symbols": [["Lcom/x/Api", "foo;V"], ["Landroid/os/Process", "killProcess;I;V"]]}"#,
            "\n",
            r#"{"unit": "C", "symbols": [["Ljava/lang/Runtime", "#,
            "\n",
        ),
    )?;
    let module = ModulePackage::new("com.example.sdk", vec![PackageFile::new(&path)]);

    let mut pipeline = SequentialVerificationPipeline::new(ManifestSymbolSource::new());
    let err = pipeline.run(&module, &trie).unwrap_err();
    assert!(matches!(err, PipelineError::Enumerate { .. }));

    // C's symbol table is unreadable; loading it would turn the verdict into an error.
    std::fs::write(
        &path,
        concat!(
            r#"{"unit": "A", "symbols": [["Lcom/example/Own", "run;V"]]}"#,
            "\n",
            r#"{"unit": "B", "symbols": [["Lcom/x/Api", "foo;V"], ["Landroid/os/Process", "killProcess;I;V"]]}"#,
            "\n",
            r#"{"unit": "C", "symbols": "not a symbol table"}"#,
            "\n",
        ),
    )?;
    let result = pipeline.run(&module, &trie)?;
    assert!(!result.passed());
    assert_eq!(
        result.restricted_usages(),
        ["Lcom/x/Api->foo;V", "Landroid/os/Process->killProcess;I;V"]
    );
    Ok(())
}

#[test]
fn worker_routes_missing_manifest_to_error() -> Result<()> {
    let dir = tempdir()?;
    let index = Arc::new(AllowlistIndex::new(Arc::new(write_rule_set(
        &dir,
        &platform_rules(),
    )?)));
    let worker = VerificationWorker::spawn("verify-it", index, ManifestSymbolSource::new())?;

    let missing = PackageFile::new(dir.path().join("missing.jsonl"));
    let err = worker
        .verify_module_blocking(ModulePackage::new("com.example.sdk", vec![missing]), 34)
        .unwrap_err();
    assert!(
        err.to_string().contains("failed to enumerate"),
        "unexpected: {err:#}"
    );

    let denied = write_manifest(
        &dir,
        "denied.jsonl",
        &[("classes.dex", &[("Ldalvik/system/DexClassLoader", "<init>;Ljava/lang/String;V")])],
    );
    let result =
        worker.verify_module_blocking(ModulePackage::new("com.example.sdk", vec![denied]), 34)?;
    assert_eq!(
        result.restricted_usages(),
        ["Ldalvik/system/DexClassLoader-><init>;Ljava/lang/String;V"]
    );
    worker.shutdown()
}

#[test]
fn unknown_api_level_falls_back_to_defaults() -> Result<()> {
    let dir = tempdir()?;
    let index = AllowlistIndex::new(Arc::new(write_rule_set(&dir, &platform_rules())?));
    let trie = index.for_api_level(21)?;

    let symbols = [SymbolReference::new(
        "Landroid/util/Log",
        "d;Ljava/lang/String;Ljava/lang/String;I",
    )];
    assert!(!SymbolVerifier::new().verify(&symbols, &trie).passed());
    Ok(())
}

#[test]
fn malformed_rules_never_widen_through_the_binary_format() -> Result<()> {
    let bundle = [SymbolReference::new(
        "Landroid/os/Bundle",
        "putBinder;Ljava/lang/String;Landroid/os/IBinder;V",
    )];
    let empty_method = Rule::allow("Landroid/os/Bundle").method("");
    let doubled_separator = Rule::allow("Landroid//os/Bundle");

    let direct = build_trie(34, vec![empty_method.clone(), doubled_separator.clone()])?;
    assert!(!SymbolVerifier::new().verify(&bundle, &direct).passed());

    let mut file = RuleSetFile::new();
    file.insert_level(34, vec![empty_method]);
    assert!(file.encode().is_err());

    file.insert_level(34, vec![doubled_separator.clone()]);
    let decoded = RuleSetFile::decode(&file.encode()?)?;
    assert_eq!(decoded.levels[&34], vec![doubled_separator.clone()]);

    let packed = build_trie(34, decoded.levels[&34].clone())?;
    assert!(packed
        .entries()
        .iter()
        .all(|(_, stored)| **stored != doubled_separator));
    assert!(!SymbolVerifier::new().verify(&bundle, &packed).passed());
    Ok(())
}
