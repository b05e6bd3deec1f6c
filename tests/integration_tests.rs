//! Integration tests for the cascade CLI.
//!
//! Each test runs the binary against a fresh project directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const HEALTHY: &str = r#"{
    "company": {"name": "Acme", "sector": "industrials"},
    "metrics": {"revenue_growth": 0.1, "debt_ratio": 0.2, "margin": 0.3, "volatility": 0.1}
}"#;

const RISKY: &str = r#"{
    "company": {"name": "Acme", "sector": "industrials"},
    "metrics": {"revenue_growth": -0.2, "debt_ratio": 0.9, "margin": 0.02, "volatility": 0.8}
}"#;

/// Helper to create a cascade Command rooted at `dir`
fn cascade(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("cascade");
    cmd.arg("--project-dir")
        .arg(dir.path())
        .env_remove("CASCADE_LOG")
        .env_remove("CASCADE_RETRY_BUDGET");
    cmd
}

fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    cascade(&dir).arg("init").assert().success();
    dir
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();
    files
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

/// The single run report in the project.
fn only_run_report(dir: &TempDir) -> Value {
    let reports = json_files(&dir.path().join(".cascade/runs"));
    assert_eq!(reports.len(), 1, "expected exactly one run report");
    read_json(&reports[0])
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_cascade_help() {
        cargo_bin_cmd!("cascade").arg("--help").assert().success();
    }

    #[test]
    fn test_cascade_version() {
        cargo_bin_cmd!("cascade").arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();

        cascade(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized cascade project"));

        assert!(dir.path().join(".cascade/cascade.toml").exists());
        assert!(dir.path().join(".cascade/snapshots").is_dir());
        assert!(dir.path().join(".cascade/runs").is_dir());
        assert!(dir.path().join(".cascade/artifacts").is_dir());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let dir = init_project();
        cascade(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Already initialized"));
    }
}

// =============================================================================
// Config
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let dir = init_project();
        cascade(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_validate_reports_warnings() {
        let dir = init_project();
        fs::write(
            dir.path().join(".cascade/cascade.toml"),
            "[run]\nvalidation_threshold = 1.5\n",
        )
        .unwrap();

        cascade(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("validation_threshold 1.5"));
    }

    #[test]
    fn test_show_applies_cli_override() {
        let dir = init_project();
        cascade(&dir)
            .args(["--retry-budget", "7", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("retry_budget = 7"));
    }

    #[test]
    fn test_show_applies_env_override() {
        let dir = init_project();
        cascade(&dir)
            .env("CASCADE_RETRY_BUDGET", "5")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("retry_budget = 5"));
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = init_project();
        fs::write(dir.path().join(".cascade/cascade.toml"), "[run\n").unwrap();

        cascade(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse cascade.toml"));
    }
}

// =============================================================================
// Graph
// =============================================================================

mod graph {
    use super::*;

    #[test]
    fn test_graph_lists_waves() {
        let dir = init_project();
        cascade(&dir)
            .arg("graph")
            .assert()
            .success()
            .stdout(predicate::str::contains("Wave 1: profile"))
            .stdout(predicate::str::contains("section.signals"))
            .stdout(predicate::str::contains("review [validator]"));
    }

    #[test]
    fn test_graph_json() {
        let dir = init_project();
        let output = cascade(&dir).args(["graph", "--json"]).output().unwrap();
        assert!(output.status.success());

        let doc: Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(doc["id"], "report");
        assert_eq!(doc["validator"], "review");
        assert_eq!(doc["repair_target"], "assemble");
        assert_eq!(doc["waves"][0], serde_json::json!(["profile"]));
    }

    #[test]
    fn test_unknown_graph() {
        let dir = init_project();
        cascade(&dir)
            .args(["graph", "--graph", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown graph 'nope'"));
    }
}

// =============================================================================
// Runs
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_healthy_run_completes() {
        let dir = init_project();

        cascade(&dir)
            .args(["run", "--ui", "json", "--input", HEALTHY])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""type":"run_started""#))
            .stdout(predicate::str::contains(r#""type":"group_joined""#))
            .stdout(predicate::str::contains(r#""status":"completed""#));

        let report = only_run_report(&dir);
        assert_eq!(report["status"], "completed");
        assert_eq!(report["retries"], 0);
        assert!(report["state"]["published"].is_object());
        assert!(report["artifact"].is_string());
        assert_eq!(json_files(&dir.path().join(".cascade/artifacts")).len(), 1);
    }

    #[test]
    fn test_input_from_file_minimal_ui() {
        let dir = init_project();
        let input = dir.path().join("input.json");
        fs::write(&input, HEALTHY).unwrap();

        cascade(&dir)
            .args(["run", "--ui", "minimal", "--input"])
            .arg(&input)
            .assert()
            .success()
            .stdout(predicate::str::contains("Done: "))
            .stdout(predicate::str::contains("Report:"));
    }

    #[test]
    fn test_risky_run_is_repaired() {
        let dir = init_project();

        cascade(&dir)
            .args(["run", "--ui", "json", "--input", RISKY])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""type":"repair_started""#));

        let report = only_run_report(&dir);
        assert_eq!(report["status"], "completed");
        assert_eq!(report["retries"], 1);
        assert_eq!(report["validations"], 2);
    }

    #[test]
    fn test_zero_retry_budget_finishes_with_warnings() {
        let dir = init_project();

        cascade(&dir)
            .args(["--retry-budget", "0", "run", "--ui", "json", "--input", RISKY])
            .assert()
            .success();

        let report = only_run_report(&dir);
        assert_eq!(report["status"], "completed-with-warnings");
        assert_eq!(report["retries"], 0);
        assert!(report["state"].get("published").is_none());
    }

    #[test]
    fn test_non_object_input_is_rejected() {
        let dir = init_project();
        let input = dir.path().join("input.json");
        fs::write(&input, "[1, 2, 3]").unwrap();

        cascade(&dir)
            .args(["run", "--input"])
            .arg(&input)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Input must be a JSON object"));
    }

    #[test]
    fn test_missing_input_key_fails_run() {
        let dir = init_project();

        cascade(&dir)
            .args(["run", "--ui", "json", "--input", r#"{"metrics": {}}"#])
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed"));

        let report = only_run_report(&dir);
        assert_eq!(report["status"], "failed");
    }

    #[test]
    fn test_status_by_prefix() {
        let dir = init_project();
        cascade(&dir)
            .args(["run", "--ui", "json", "--input", HEALTHY])
            .assert()
            .success();

        let run_id = only_run_report(&dir)["run_id"].as_str().unwrap().to_string();
        cascade(&dir)
            .args(["status", &run_id[..8]])
            .assert()
            .success()
            .stdout(predicate::str::contains("Status:      completed"))
            .stdout(predicate::str::contains("assemble"));

        cascade(&dir)
            .args(["status", &run_id, "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains(&run_id));
    }

    #[test]
    fn test_status_unknown_run() {
        let dir = init_project();
        cascade(&dir)
            .args(["status", "deadbeef"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No run matches 'deadbeef'"));
    }
}

// =============================================================================
// Snapshots and resume
// =============================================================================

mod snapshots {
    use super::*;

    /// Run the healthy input and return the id of its `scored` snapshot.
    fn scored_snapshot(dir: &TempDir) -> String {
        cascade(dir)
            .args(["run", "--ui", "json", "--input", HEALTHY])
            .assert()
            .success();

        let report = only_run_report(dir);
        report["snapshots"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["boundary"] == "scored")
            .and_then(|s| s["id"].as_str())
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_run_persists_snapshots() {
        let dir = init_project();
        let id = scored_snapshot(&dir);

        assert!(dir.path().join(format!(".cascade/snapshots/{}.json", id)).exists());
        cascade(&dir)
            .args(["snapshots", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains(&id))
            .stdout(predicate::str::contains("after:assemble"));
    }

    #[test]
    fn test_show_snapshot_state() {
        let dir = init_project();
        let id = scored_snapshot(&dir);

        cascade(&dir)
            .args(["snapshots", "show", &id[..8]])
            .assert()
            .success()
            .stdout(predicate::str::contains("boundary: scored (after score)"))
            .stdout(predicate::str::contains("risk_score"));
    }

    #[test]
    fn test_resume_from_snapshot() {
        let dir = init_project();
        let id = scored_snapshot(&dir);

        cascade(&dir)
            .args(["resume", &id, "--ui", "json"])
            .args(["--set", r#"company={"name": "Beta"}"#])
            .assert()
            .success()
            .stdout(predicate::str::contains(&id));

        let reports = json_files(&dir.path().join(".cascade/runs"));
        assert_eq!(reports.len(), 2);
        let resumed: Vec<Value> = reports
            .iter()
            .map(|p| read_json(p))
            .filter(|r| r["resumed_from"] == id.as_str())
            .collect();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0]["status"], "completed");
        assert_eq!(resumed[0]["summary"]["restored"], 2);
        assert_eq!(resumed[0]["state"]["company"]["name"], "Beta");
    }

    #[test]
    fn test_resume_rejects_downstream_override() {
        let dir = init_project();
        let id = scored_snapshot(&dir);

        cascade(&dir)
            .args(["resume", &id, "--set", r#"report={}"#])
            .assert()
            .failure()
            .stderr(predicate::str::contains("report"));
    }

    #[test]
    fn test_invalidate_snapshot() {
        let dir = init_project();
        let id = scored_snapshot(&dir);

        cascade(&dir)
            .args(["snapshots", "invalidate", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Invalidated snapshot"));
        assert!(!dir.path().join(format!(".cascade/snapshots/{}.json", id)).exists());

        cascade(&dir)
            .args(["resume", &id])
            .assert()
            .failure();
    }

    #[test]
    fn test_prune_with_nothing_expired() {
        let dir = init_project();
        scored_snapshot(&dir);

        cascade(&dir)
            .args(["snapshots", "prune"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Pruned 0 expired snapshot(s)."));
    }
}
