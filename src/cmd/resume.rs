//! Resume from a snapshot (`cascade resume`).

use anyhow::{Context, Result, bail};
use cascade::config::CascadeConfig;
use cascade::snapshot::SnapshotCache;
use cascade::state::PartialState;
use cascade::ui::UiMode;
use cascade_common::SnapshotId;
use serde_json::Value;
use tokio::sync::mpsc;

use super::super::Cli;
use super::build_orchestrator;
use super::run::{follow_run, spawn_ui};

pub async fn cmd_resume(
    cli: &Cli,
    config: &CascadeConfig,
    snapshot: &str,
    overrides: &[String],
    ui: &str,
) -> Result<()> {
    config.ensure_directories()?;
    let overrides = parse_overrides(overrides)?;
    let mode = UiMode::parse(ui);

    let (tx, rx) = mpsc::channel(256);
    let orchestrator = build_orchestrator(config, tx)?;
    let snapshot_id = resolve_snapshot(orchestrator.snapshots(), snapshot)?;
    let graph_id = orchestrator.snapshots().get(snapshot_id)?.graph_id.clone();
    let graph = orchestrator.graph(&graph_id)?;
    let ui_task = spawn_ui(graph.len(), mode, cli.verbose, rx);

    let run_id = orchestrator.resume_run(snapshot_id, overrides).await?;
    follow_run(config, orchestrator, run_id, ui_task, mode).await
}

/// Resolve a full snapshot id or a unique prefix of one.
pub fn resolve_snapshot(cache: &SnapshotCache, raw: &str) -> Result<SnapshotId> {
    if let Ok(id) = raw.parse::<SnapshotId>() {
        return Ok(id);
    }
    let matches: Vec<SnapshotId> = cache
        .list()?
        .into_iter()
        .map(|info| info.id)
        .filter(|id| id.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No snapshot matches '{}'", raw),
        _ => bail!("Snapshot prefix '{}' is ambiguous ({} matches)", raw, matches.len()),
    }
}

/// Parse repeated `key=<json>` overrides.
pub fn parse_overrides(raw: &[String]) -> Result<PartialState> {
    let mut overrides = PartialState::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("Override '{}' is not of the form key=<json>", entry))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Override '{}' has an empty key", entry);
        }
        let value: Value = serde_json::from_str(value)
            .with_context(|| format!("Override value for '{}' is not valid JSON", key))?;
        overrides.insert(key.to_string(), value);
    }
    Ok(overrides)
}
