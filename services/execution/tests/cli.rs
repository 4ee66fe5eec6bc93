//! Command line surface of the `mev_executor` binary

use mev_execution::config::ExecutionConfig;
use std::process::Command;

fn mev_executor() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_mev_executor"));
    command.env_remove("RUST_LOG");
    command
}

#[test]
fn test_init_config_writes_loadable_template() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("execution.toml");

    let output = mev_executor()
        .args(["init-config", "--output"])
        .arg(&path)
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "init-config failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let loaded = ExecutionConfig::from_file(&path).unwrap();
    assert!(loaded.relays.is_empty());
    assert_eq!(
        loaded.nonce.reservation_ttl_ms,
        ExecutionConfig::default().nonce.reservation_ttl_ms
    );
}

#[test]
fn test_submit_rejects_template_without_relays() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("execution.toml");
    ExecutionConfig::default().save_to_file(&path).unwrap();
    let opportunities = dir.path().join("opportunities.json");
    std::fs::write(&opportunities, "[]").unwrap();

    let output = mev_executor()
        .arg("submit")
        .arg("--config")
        .arg(&path)
        .arg("--file")
        .arg(&opportunities)
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("at least one relay"));
}
