use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

#[allow(deprecated)]
fn lore() -> Command {
    let mut cmd = Command::cargo_bin("lore").expect("binary");
    cmd.env("LORE_LLM_MODE", "stub").env_remove("LORE_MODEL");
    cmd
}

fn setup_repo() -> tempfile::TempDir {
    let temp = tempdir().unwrap();
    let root = temp.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("README.md"), "# Demo\nPrints a greeting.\n").unwrap();
    fs::write(root.join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    fs::write(root.join("src/main.rs"), "fn main() { println!(\"hi\"); }\n").unwrap();
    temp
}

fn run_json(root: &Path, args: &[&str]) -> Value {
    let output = lore()
        .args(args)
        .arg(root)
        .arg("--json")
        .output()
        .expect("command run");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid json")
}

#[test]
fn scan_json_counts_iterations() {
    let temp = setup_repo();
    let root = temp.path();

    let first = run_json(root, &["--yes", "scan"]);
    assert_eq!(first["iteration"], 1);
    assert_eq!(first["language"], "rust");
    assert_eq!(first["project_type"], "cli");
    assert_eq!(first["file_count"], 3);

    let second = run_json(root, &["--yes", "scan"]);
    assert_eq!(second["iteration"], 2);
    assert!(root.join(".lore/scan.json").exists());
}

#[test]
fn analyze_quick_then_status_reports_fresh_tier() {
    let temp = setup_repo();
    let root = temp.path();

    let results = run_json(root, &["--yes", "analyze", "--tier", "quick"]);
    let results = results.as_array().expect("array of results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["kind"], "quick");
    assert_eq!(results[0]["cached"], false);
    assert!(results[0]["knowledge_files"]["overview.md"].is_string());

    let status = run_json(root, &["status"]);
    assert_eq!(status["tiers"][0]["tier"], "quick");
    assert_eq!(status["tiers"][0]["fresh"], true);
    assert_eq!(status["tiers"][1]["fresh"], false);
    assert_eq!(status["tiers"][1]["reasons"][0], "record_missing");
    assert_eq!(status["health"]["last_tier"], "quick");

    let again = run_json(root, &["--yes", "analyze", "--tier", "quick"]);
    assert_eq!(again[0]["cached"], true);
}

#[test]
fn runs_without_a_terminal_need_yes() {
    let temp = setup_repo();
    let root = temp.path();

    lore()
        .arg("scan")
        .arg(root)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Permission denied"));
    assert!(!root.join(".lore/scan.json").exists());
}

#[test]
fn status_text_before_any_run() {
    let temp = setup_repo();

    lore()
        .arg("status")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Scan: never run"))
        .stdout(predicate::str::contains("stale (record_missing)"));
}

#[test]
fn continue_flags_are_exclusive() {
    let temp = setup_repo();

    lore()
        .args(["analyze", "--tier", "quick", "--continue", "--continue-to", "deep"])
        .arg(temp.path())
        .assert()
        .failure();
}

#[test]
fn missing_project_is_an_error() {
    let temp = tempdir().unwrap();

    lore()
        .arg("status")
        .arg(temp.path().join("nope"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot open project"));
}
