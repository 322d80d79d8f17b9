//! CLI smoke tests: run the `taxlens` binary against a temp workspace.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use common::{facts_seed, write_corrupt, write_pdf};

fn setup() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let corpus = root.join("corpus");
    write_pdf(
        &corpus,
        "guides/gst-general-guide.pdf",
        &[&[
            "GST: General Guide for Businesses",
            "IRAS e-Tax Guide",
            "GST is charged on standard-rated supplies. The GST rate applies to the value",
            "of the supply made by a GST-registered business in Singapore.",
        ]],
    );

    let config_path = root.join("taxlens.toml");
    fs::write(
        &config_path,
        format!(
            r#"[db]
path = "{}/data/taxlens.sqlite"

[ingest]
root = "{}"

[facts]
seed_path = "{}"
"#,
            root.display(),
            corpus.display(),
            facts_seed().display()
        ),
    )
    .unwrap();
    (tmp, config_path)
}

fn run(config: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_taxlens"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run taxlens");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn init_is_idempotent_and_imports_facts() {
    let (_tmp, config) = setup();
    let (stdout, stderr, ok) = run(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));
    assert!(!stdout.contains(" 0 inserted"));

    let (stdout, _, ok) = run(&config, &["init"]);
    assert!(ok);
    assert!(stdout.contains("0 inserted"));
}

#[test]
fn facts_get_respects_as_of() {
    let (_tmp, config) = setup();
    run(&config, &["init"]);

    let (stdout, _, ok) = run(&config, &["facts", "get", "gst", "standard_rate", "--as-of", "2023"]);
    assert!(ok);
    assert!(stdout.contains("gst.standard_rate = 8%"), "{}", stdout);

    let (stdout, _, ok) = run(&config, &["facts", "history", "gst", "standard_rate"]);
    assert!(ok);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["YA 2007  7%", "YA 2023  8%", "YA 2024  9%"]);

    let (stdout, _, ok) = run(&config, &["facts", "get", "gst", "no_such_key"]);
    assert!(ok);
    assert!(stdout.contains("No fact"));
}

#[test]
fn ingest_then_ask_json() {
    let (tmp, config) = setup();
    write_corrupt(&tmp.path().join("corpus"));
    run(&config, &["init"]);

    let (stdout, stderr, ok) = run(&config, &["ingest", "--json", "--progress", "off"]);
    assert!(ok, "ingest failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["new"], 1);
    assert_eq!(report["failed"], 1);

    let (stdout, _, ok) = run(&config, &["ingest", "--json", "--progress", "off"]);
    assert!(ok);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["skipped"], 1);
    assert_eq!(report["new"], 0);

    let (stdout, stderr, ok) = run(&config, &["ask", "What is the GST rate?", "--json"]);
    assert!(ok, "ask failed: {}", stderr);
    let answer: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(answer["text"].as_str().unwrap().contains("9%"));
    assert_eq!(answer["citations"][0]["kind"], "structured_facts");
    assert_eq!(answer["no_answer"], false);

    let (stdout, _, ok) = run(&config, &["ledger"]);
    assert!(ok);
    assert!(stdout.contains("guides/gst-general-guide"));
}

#[test]
fn empty_question_fails() {
    let (_tmp, config) = setup();
    run(&config, &["init"]);
    let (_, stderr, ok) = run(&config, &["ask", "   "]);
    assert!(!ok);
    assert!(stderr.contains("question is empty"));
}

#[test]
fn missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run(&tmp.path().join("nope.toml"), &["ledger"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"));
}
