// ABOUTME: Tests for the command-line interface
// ABOUTME: Runs the binary for commands that need neither a subgraph nor a database

use std::process::{Command, Output};
use tempfile::tempdir;

fn run(args: &[&str], home: &std::path::Path) -> Output {
    let bin_path = env!("CARGO_BIN_EXE_subgraph-replicator");
    Command::new(bin_path)
        .args(args)
        .env("HOME", home)
        .env_remove("SUBGRAPH_ENDPOINT")
        .env_remove("SUBGRAPH_API_KEY")
        .env_remove("TARGET_URL")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_events_lists_builtin_registry() {
    let home = tempdir().unwrap();
    let output = run(&["events"], home.path());
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("allocationEvents"));
    assert!(stdout.contains("deposit_events"));
}

#[test]
fn test_events_filters_by_group() {
    let home = tempdir().unwrap();
    let output = run(&["events", "--group", "strategy_manager_events"], home.path());
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("deposits"));
    assert!(!stdout.contains("allocationEvents"));
}

#[test]
fn test_plan_prints_cursor_filter() {
    let home = tempdir().unwrap();
    let output = run(
        &["plan", "--event", "allocationEvents", "--block", "100", "--log-index", "3"],
        home.path(),
    );
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("allocationEvents(first: 1000"));
    assert!(stdout.contains("{ blockNumber: 100, logIndex_gt: 3 }"));
}

#[test]
fn test_plan_rejects_unknown_event() {
    let home = tempdir().unwrap();
    let output = run(&["plan", "--event", "nope"], home.path());
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("unknown event type 'nope'"));
}

#[test]
fn test_validate_uses_config_file() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("replicator.toml");
    std::fs::write(&config, "[sync]\npage_size = 5000\n").unwrap();

    let output = run(&["--config", config.to_str().unwrap(), "validate"], dir.path());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("page_size"));

    std::fs::write(&config, "[sync]\npage_size = 500\n").unwrap();
    let output = run(&["--config", config.to_str().unwrap(), "validate"], dir.path());
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("registry are valid"));
}

#[test]
fn test_status_without_journal() {
    let home = tempdir().unwrap();
    let state = home.path().join("sync-state.json");
    let output = run(&["--state-path", state.to_str().unwrap(), "status"], home.path());

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No sync journal"));
}

#[test]
fn test_sync_requires_endpoint() {
    let home = tempdir().unwrap();
    let output = run(&["sync", "--once"], home.path());
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("Subgraph endpoint not provided"));
}
