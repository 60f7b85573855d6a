//! Integration tests for `spindle generate` and `spindle run`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn spindle(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("spindle").unwrap();
    cmd.current_dir(temp_dir.path()).env("HOME", temp_dir.path()).env_remove("RUST_LOG");
    cmd
}

fn count_prediction_lines(dir: &std::path::Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("part-"))
        .map(|p| fs::read_to_string(p).unwrap().lines().filter(|l| !l.trim().is_empty()).count())
        .sum()
}

#[test]
fn test_run_rejects_bad_epochs() {
    let temp_dir = TempDir::new().unwrap();
    spindle(&temp_dir)
        .args(["run", "--images", "i", "--labels", "l", "--epochs", "three"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--epochs"));
}

#[test]
fn test_run_rejects_unknown_format() {
    let temp_dir = TempDir::new().unwrap();
    spindle(&temp_dir)
        .args(["run", "--images", "i", "--labels", "l", "--format", "parquet"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parquet"));
}

#[test]
fn test_run_missing_inputs_fails() {
    let temp_dir = TempDir::new().unwrap();
    spindle(&temp_dir)
        .args(["run", "--images", "missing/images", "--labels", "missing/labels"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("train run failed"));
}

#[test]
fn test_generate_train_then_inference() {
    let temp_dir = TempDir::new().unwrap();

    spindle(&temp_dir)
        .args(["generate", "--dir", "train_csv", "--count", "600"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Generated 600 records"));
    spindle(&temp_dir)
        .args(["generate", "--dir", "test_csv", "--count", "100", "--seed", "7", "--partitions", "3"])
        .assert()
        .success();

    spindle(&temp_dir)
        .args([
            "run",
            "--images",
            "train_csv/images",
            "--labels",
            "train_csv/labels",
            "--epochs",
            "1",
            "--steps",
            "600",
            "--cluster_size",
            "3",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete"))
        .stdout(predicate::str::contains("checkpoint.json"));
    assert!(temp_dir.path().join("mnist_model").join("checkpoint.json").exists());

    let output = spindle(&temp_dir)
        .args([
            "run",
            "--images",
            "test_csv/images",
            "--labels",
            "test_csv/labels",
            "--mode",
            "inference",
            "--cluster_size",
            "3",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["mode"], "inference");
    assert_eq!(report["prediction_lines"], 100);
    assert_eq!(count_prediction_lines(&temp_dir.path().join("predictions")), 100);
    assert!(temp_dir.path().join("predictions").join("_SUCCESS").exists());
}

#[test]
fn test_config_file_sets_cluster_size() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(".spindlerc"), "cluster_size = 100000\n").unwrap();
    spindle(&temp_dir).args(["generate", "--dir", "csv", "--count", "10"]).assert().success();

    spindle(&temp_dir)
        .args(["run", "--images", "csv/images", "--labels", "csv/labels"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Insufficient resources"));
}
