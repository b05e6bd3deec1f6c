//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled        |
//! |--------------|-------------------------|
//! | `init`       | `Init`                  |
//! | `run`        | `Run`                   |
//! | `resume`     | `Resume`                |
//! | `status`     | `Status`                |
//! | `snapshots`  | `Snapshots`             |
//! | `graph`      | `Graph`                 |
//! | `config`     | `Config`                |

pub mod config;
pub mod graph;
pub mod init;
pub mod resume;
pub mod run;
pub mod snapshots;
pub mod status;

pub use config::cmd_config;
pub use graph::cmd_graph;
pub use init::cmd_init;
pub use resume::cmd_resume;
pub use run::cmd_run;
pub use snapshots::cmd_snapshots;
pub use status::cmd_status;

use anyhow::{Context, Result};
use cascade::config::CascadeConfig;
use cascade::orchestrator::Orchestrator;
use cascade::persistence::FileArtifactStore;
use cascade::pipelines;
use cascade::scheduler::{RunEvent, RunOutcome};
use cascade::snapshot::SnapshotCache;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Snapshot cache for the project, with persisted snapshots loaded.
pub fn open_snapshot_cache(config: &CascadeConfig) -> Result<Arc<SnapshotCache>> {
    let cache = config.snapshot_cache();
    let loaded = cache
        .load_from_disk()
        .context("Failed to load persisted snapshots")?;
    tracing::debug!(loaded, "snapshot cache opened");
    Ok(Arc::new(cache))
}

/// Orchestrator with the built-in graphs registered.
pub fn build_orchestrator(
    config: &CascadeConfig,
    events: mpsc::Sender<RunEvent>,
) -> Result<Orchestrator> {
    let orchestrator = Orchestrator::new(config.scheduler_config(), open_snapshot_cache(config)?)
        .with_artifact_store(Arc::new(FileArtifactStore::new(config.artifacts_dir())))
        .with_event_channel(events);
    for graph in pipelines::builtin_graphs(config)? {
        orchestrator.register_graph(graph)?;
    }
    Ok(orchestrator)
}

pub fn run_report_path(config: &CascadeConfig, outcome: &RunOutcome) -> PathBuf {
    config.runs_dir().join(format!("{}.json", outcome.run_id))
}

/// Write the run report to `.cascade/runs/<run-id>.json`.
pub fn write_run_report(config: &CascadeConfig, outcome: &RunOutcome) -> Result<PathBuf> {
    let dir = config.runs_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let path = run_report_path(config, outcome);
    let json = serde_json::to_string_pretty(outcome).context("Failed to serialize run report")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write run report: {}", path.display()))?;
    Ok(path)
}
