//! Integration tests for the autoisf binary.
//!
//! These tests verify end-to-end behavior including:
//! - Decision assembly from snapshot files
//! - Audit logging and dry runs
//! - CSV rollup and history
//! - Policy display

use assert_cmd::Command;
use chrono::{Duration, SecondsFormat, Utc};
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// CLI with config lookup pointed into the temp dir
fn cli(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("autoisf"));
    cmd.env("XDG_CONFIG_HOME", temp_dir.path().join("config"));
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Rapid-rise snapshot ending now, with the given policy JSON
fn write_snapshot(dir: &Path, policy: &str) -> PathBuf {
    let now = Utc::now();
    let ts = |minutes: i64| (now - Duration::minutes(minutes)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let json = format!(
        r#"{{
            "now": "{now}",
            "glucose": [
                {{ "value": 120, "timestamp": "{t15}" }},
                {{ "value": 180, "timestamp": "{t10}" }},
                {{ "value": 240, "timestamp": "{t5}" }},
                {{ "value": 300, "timestamp": "{now}" }}
            ],
            "policy": {policy},
            "iob": {{ "iob": 1.0 }},
            "profile": {{ "target_low": 100, "target_high": 100, "sens": 50, "current_basal": 1.0 }}
        }}"#,
        now = ts(0),
        t5 = ts(5),
        t10 = ts(10),
        t15 = ts(15),
        policy = policy,
    );
    let path = dir.join("snapshot.json");
    fs::write(&path, json).expect("Failed to write snapshot");
    path
}

const ACCEL_POLICY: &str = r#"{ "autoisf": { "enabled": true, "bg_accel_weight": 0.15 } }"#;

#[test]
fn test_cli_help() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "autoISF sensitivity and dosing-safety decisions",
        ));
}

#[test]
fn test_decide_logs_to_audit() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");
    let snapshot = write_snapshot(temp_dir.path(), ACCEL_POLICY);

    cli(&temp_dir)
        .arg("decide")
        .arg("--snapshot")
        .arg(&snapshot)
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Sensitivity ratio: 0.70"))
        .stdout(predicate::str::contains("acce_ISF"))
        .stdout(predicate::str::contains("Decision logged"));

    let log = fs::read_to_string(data_dir.join("audit/decisions.jsonl"))
        .expect("Failed to read audit log");
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("per_factor_breakdown"));
}

#[test]
fn test_decide_json_output() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");
    let snapshot = write_snapshot(temp_dir.path(), ACCEL_POLICY);

    let output = cli(&temp_dir)
        .arg("decide")
        .arg("--snapshot")
        .arg(&snapshot)
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("--json")
        .arg("--dry-run")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let record: serde_json::Value =
        serde_json::from_slice(&output).expect("stdout should be one JSON record");
    assert_eq!(record["sensitivity_ratio"], 0.7);
    assert_eq!(record["per_factor_breakdown"].as_array().unwrap().len(), 5);
    assert_eq!(record["autosens_bounds"]["min"], 1.0);
    assert!(!data_dir.join("audit/decisions.jsonl").exists());
}

#[test]
fn test_dry_run_does_not_log() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");
    let snapshot = write_snapshot(temp_dir.path(), ACCEL_POLICY);

    cli(&temp_dir)
        .arg("decide")
        .arg("--snapshot")
        .arg(&snapshot)
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run"));

    assert!(!data_dir.join("audit").exists());
}

#[test]
fn test_configured_policy_used_when_snapshot_has_none() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");
    let snapshot = write_snapshot(temp_dir.path(), "null");

    let config_path = temp_dir.path().join("custom.toml");
    fs::write(
        &config_path,
        r#"
[policy.autoisf]
enabled = true
bg_accel_weight = 0.15
min_ratio = 0.8
"#,
    )
    .unwrap();

    cli(&temp_dir)
        .arg("decide")
        .arg("--snapshot")
        .arg(&snapshot)
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("--config")
        .arg(&config_path)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sensitivity ratio: 0.80"))
        .stdout(predicate::str::contains("autoISF_min 0.8"));
}

#[test]
fn test_missing_snapshot_gives_neutral_decision() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");

    cli(&temp_dir)
        .arg("decide")
        .arg("--snapshot")
        .arg(temp_dir.path().join("nonexistent.json"))
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Sensitivity ratio: 1.00"))
        .stdout(predicate::str::contains("insufficient data"));
}

#[test]
fn test_rollup_creates_csv() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");
    let snapshot = write_snapshot(temp_dir.path(), ACCEL_POLICY);

    for _ in 0..3 {
        cli(&temp_dir)
            .arg("decide")
            .arg("--snapshot")
            .arg(&snapshot)
            .arg("--data-dir")
            .arg(&data_dir)
            .assert()
            .success();
    }

    cli(&temp_dir)
        .arg("rollup")
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Rolled up 3 decisions"));

    let csv_content = fs::read_to_string(data_dir.join("decisions.csv")).expect("Failed to read CSV");
    assert!(csv_content.starts_with("id,timestamp,glucose,sensitivity_ratio"));
    assert_eq!(csv_content.lines().count(), 4);
}

#[test]
fn test_rollup_with_cleanup() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");
    let snapshot = write_snapshot(temp_dir.path(), ACCEL_POLICY);

    cli(&temp_dir)
        .arg("decide")
        .arg("--snapshot")
        .arg(&snapshot)
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success();

    cli(&temp_dir)
        .arg("rollup")
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("--cleanup")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleaned up 1 processed audit logs"));

    let leftovers: Vec<_> = fs::read_dir(data_dir.join("audit"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_rollup_without_log() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .arg("rollup")
        .arg("--data-dir")
        .arg(temp_dir.path().join("data"))
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to roll up"));
}

#[test]
fn test_history_lists_recent_decisions() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");

    cli(&temp_dir)
        .arg("history")
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("No decisions in the last 24 hours"));

    let snapshot = write_snapshot(temp_dir.path(), ACCEL_POLICY);
    cli(&temp_dir)
        .arg("decide")
        .arg("--snapshot")
        .arg(&snapshot)
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success();

    cli(&temp_dir)
        .arg("history")
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("ratio 0.70"));
}

#[test]
fn test_policy_table() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .arg("policy")
        .assert()
        .success()
        .stdout(predicate::str::contains("[autoisf]"))
        .stdout(predicate::str::contains("iob_threshold_percent"))
        .stdout(predicate::str::contains("[keto_protect]"));
}

#[test]
fn test_policy_reports_out_of_range_values() {
    let temp_dir = setup_test_dir();
    let config_path = temp_dir.path().join("custom.toml");
    fs::write(&config_path, "[policy.b30]\nbasal_factor = 40.0\n").unwrap();

    cli(&temp_dir)
        .arg("policy")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Out of range"))
        .stdout(predicate::str::contains("b30.basal_factor"));
}
