//! Pipeline execution (`cascade run`).

use anyhow::{Context, Result, bail};
use cascade::config::CascadeConfig;
use cascade::orchestrator::Orchestrator;
use cascade::scheduler::{RunEvent, RunOutcome};
use cascade::state::PartialState;
use cascade::ui::{RunUI, UiMode};
use cascade_common::{RunId, RunStatus};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::super::Cli;
use super::{build_orchestrator, write_run_report};

pub async fn cmd_run(
    cli: &Cli,
    config: &CascadeConfig,
    graph_id: &str,
    input: &str,
    ui: &str,
) -> Result<()> {
    config.ensure_directories()?;
    let input = parse_input(input)?;
    let mode = UiMode::parse(ui);

    let (tx, rx) = mpsc::channel(256);
    let orchestrator = build_orchestrator(config, tx)?;
    let graph = orchestrator.graph(graph_id)?;
    let ui_task = spawn_ui(graph.len(), mode, cli.verbose, rx);

    let run_id = orchestrator.start_run(graph_id, input).await?;
    follow_run(config, orchestrator, run_id, ui_task, mode).await
}

/// Parse `--input`: an inline JSON object, or a path to a file holding one.
pub fn parse_input(raw: &str) -> Result<PartialState> {
    let text = if raw.trim_start().starts_with('{') {
        raw.to_string()
    } else {
        std::fs::read_to_string(raw).with_context(|| format!("Failed to read input file: {}", raw))?
    };
    let value: Value = serde_json::from_str(&text).context("Input is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => bail!("Input must be a JSON object, got {}", json_kind(&other)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Render events until every sender is dropped.
pub(crate) fn spawn_ui(
    total_stages: usize,
    mode: UiMode,
    verbose: bool,
    mut rx: mpsc::Receiver<RunEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ui = RunUI::new(total_stages, mode, verbose);
        while let Some(event) = rx.recv().await {
            ui.handle_event(&event);
        }
    })
}

/// Wait for a run (cancelling it on Ctrl-C), then write and print its report.
pub(crate) async fn follow_run(
    config: &CascadeConfig,
    orchestrator: Orchestrator,
    run_id: RunId,
    ui_task: JoinHandle<()>,
    mode: UiMode,
) -> Result<()> {
    let outcome = tokio::select! {
        outcome = orchestrator.wait(run_id) => outcome?,
        Ok(()) = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling run {}...", run_id.short());
            orchestrator.cancel_run(run_id).await?;
            orchestrator.wait(run_id).await?
        }
    };

    // The UI task ends once the orchestrator's event sender is gone.
    drop(orchestrator);
    if let Err(e) = ui_task.await {
        tracing::warn!(error = %e, "UI task ended abnormally");
    }

    let path = write_run_report(config, &outcome)?;
    if mode != UiMode::Json {
        print_outcome(&outcome);
        println!("Report: {}", path.display());
    }

    if outcome.status == RunStatus::Failed {
        let reason = outcome
            .fatal_error()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "see run report".to_string());
        bail!("Run {} failed: {}", outcome.run_id.short(), reason);
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    println!();
    println!("Run:     {}", outcome.run_id);
    println!("Status:  {}", outcome.status);
    if let Some(validation) = &outcome.validation {
        println!("Review:  {}", validation.summary());
    }
    if outcome.retries > 0 {
        println!("Repairs: {}", outcome.retries);
    }
    for error in &outcome.errors {
        let scope = error.stage.as_deref().unwrap_or("run");
        println!("Error:   [{}] {}", scope, error.message);
    }
    for snapshot in &outcome.snapshots {
        println!("Snapshot {} at {}", snapshot.id, snapshot.boundary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_inline_input() {
        let input = parse_input(r#"{"x": 1, "y": [true]}"#).unwrap();
        assert_eq!(input.get("x"), Some(&json!(1)));
        assert_eq!(input.get("y"), Some(&json!([true])));
    }

    #[test]
    fn test_parse_input_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, r#"{"company": {"name": "Acme"}}"#).unwrap();

        let input = parse_input(path.to_str().unwrap()).unwrap();
        assert_eq!(input.get("company"), Some(&json!({"name": "Acme"})));
    }

    #[test]
    fn test_parse_input_rejects_non_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, "[1, 2]").unwrap();

        let err = parse_input(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_parse_input_missing_file() {
        let err = parse_input("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read input file"));
    }
}
