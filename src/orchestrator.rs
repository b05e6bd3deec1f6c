//! Trigger interface: start, resume, observe and cancel runs.
//!
//! The [`Orchestrator`] owns a registry of pipeline graphs, the shared
//! snapshot cache and one entry per run launched through it. Each run
//! executes on its own tokio task; callers get a [`RunId`] back immediately
//! and use [`Orchestrator::get_status`] or [`Orchestrator::wait`] to follow it.

use crate::errors::{OrchestratorError, Result};
use crate::graph::PipelineGraph;
use crate::persistence::ArtifactStore;
use crate::scheduler::{
    RunControl, RunError, RunEvent, RunOutcome, RunPlan, RunProgress, Scheduler, SchedulerConfig,
};
use crate::snapshot::SnapshotCache;
use crate::state::PartialState;
use cascade_common::{RunId, RunStatus, SnapshotId, ValidationResult};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type OutcomeFuture = Shared<BoxFuture<'static, std::result::Result<RunOutcome, String>>>;

/// Point-in-time view of a run returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: RunId,
    pub graph_id: String,
    pub status: RunStatus,
    pub last_validation: Option<ValidationResult>,
    pub errors: Vec<RunError>,
    pub retries: u32,
    pub completed_stages: usize,
    pub total_stages: usize,
}

struct RunEntry {
    graph_id: String,
    cancel: CancellationToken,
    progress: watch::Receiver<RunProgress>,
    outcome: OutcomeFuture,
}

/// Registry of graphs and runs.
pub struct Orchestrator {
    graphs: RwLock<HashMap<String, Arc<PipelineGraph>>>,
    runs: Arc<Mutex<HashMap<RunId, RunEntry>>>,
    snapshots: Arc<SnapshotCache>,
    config: SchedulerConfig,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(config: SchedulerConfig, snapshots: Arc<SnapshotCache>) -> Self {
        Self {
            graphs: RwLock::new(HashMap::new()),
            runs: Arc::new(Mutex::new(HashMap::new())),
            snapshots,
            config,
            artifacts: None,
            event_tx: None,
        }
    }

    /// Save the final state of successful runs into `store`.
    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Forward run events of every run to `tx`.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCache> {
        &self.snapshots
    }

    /// Register a graph under its id, replacing any previous graph with that id.
    pub fn register_graph(&self, graph: PipelineGraph) -> Result<Arc<PipelineGraph>> {
        let graph = Arc::new(graph);
        let previous = self
            .graphs
            .write()
            .map_err(|_| OrchestratorError::LockPoisoned("graph registry"))?
            .insert(graph.id().to_string(), Arc::clone(&graph));
        if previous.is_some() {
            warn!(graph = %graph.id(), "replacing registered graph");
        }
        Ok(graph)
    }

    pub fn graph(&self, id: &str) -> Result<Arc<PipelineGraph>> {
        self.graphs
            .read()
            .map_err(|_| OrchestratorError::LockPoisoned("graph registry"))?
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownGraph(id.to_string()))
    }

    /// Start a fresh run of `graph_id` over `input`.
    pub async fn start_run(&self, graph_id: &str, input: PartialState) -> Result<RunId> {
        let graph = self.graph(graph_id)?;
        let plan = RunPlan::fresh(graph, input)?;
        Ok(self.launch(plan).await)
    }

    /// Start a new run from a snapshot, applying `overrides` first.
    pub async fn resume_run(&self, snapshot: SnapshotId, overrides: PartialState) -> Result<RunId> {
        let graph_id = self.snapshots.get(snapshot)?.graph_id.clone();
        let graph = self.graph(&graph_id)?;
        let plan = self.snapshots.resume_plan(snapshot, graph, overrides)?;
        Ok(self.launch(plan).await)
    }

    async fn launch(&self, plan: RunPlan) -> RunId {
        let run_id = plan.run_id;
        let graph_id = plan.graph.id().to_string();
        let total_stages = plan.graph.len();

        let (progress_tx, progress_rx) = watch::channel(RunProgress {
            total_stages,
            ..RunProgress::default()
        });
        let control = RunControl {
            cancel: CancellationToken::new(),
            progress: Some(progress_tx),
        };
        let cancel = control.cancel.clone();

        let mut scheduler =
            Scheduler::new(self.config.clone()).with_snapshot_cache(Arc::clone(&self.snapshots));
        if let Some(tx) = &self.event_tx {
            scheduler = scheduler.with_event_channel(tx.clone());
        }
        let artifacts = self.artifacts.clone();

        let handle = tokio::spawn(async move {
            let mut outcome = scheduler.execute(plan, control).await;
            if outcome.is_success()
                && let Some(store) = artifacts
            {
                match store.save(outcome.run_id, &outcome.state) {
                    Ok(id) => outcome.artifact = Some(id),
                    Err(err) => {
                        warn!(run_id = %outcome.run_id, error = %err, "failed to save artifact");
                        outcome.errors.push(RunError {
                            stage: None,
                            message: err.to_string(),
                            fatal: false,
                        });
                    }
                }
            }
            outcome
        });
        let outcome = handle
            .map(|joined| joined.map_err(|e| e.to_string()))
            .boxed()
            .shared();

        info!(run_id = %run_id, graph = %graph_id, "run launched");
        self.runs.lock().await.insert(
            run_id,
            RunEntry {
                graph_id,
                cancel,
                progress: progress_rx,
                outcome,
            },
        );
        run_id
    }

    /// Current status, last validation, errors and retries of a run.
    pub async fn get_status(&self, run_id: RunId) -> Result<RunStatusReport> {
        let runs = self.runs.lock().await;
        let entry = runs.get(&run_id).ok_or(OrchestratorError::UnknownRun(run_id))?;
        let progress = entry.progress.borrow().clone();
        Ok(RunStatusReport {
            run_id,
            graph_id: entry.graph_id.clone(),
            status: progress.status,
            last_validation: progress.last_validation,
            errors: progress.errors,
            retries: progress.retries,
            completed_stages: progress.completed_stages,
            total_stages: progress.total_stages,
        })
    }

    /// Request cancellation. Returns false if the run had already finished.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<bool> {
        let runs = self.runs.lock().await;
        let entry = runs.get(&run_id).ok_or(OrchestratorError::UnknownRun(run_id))?;
        if entry.progress.borrow().status.is_terminal() {
            return Ok(false);
        }
        info!(run_id = %run_id, "cancellation requested");
        entry.cancel.cancel();
        Ok(true)
    }

    /// Wait for a run to reach a terminal status.
    pub async fn wait(&self, run_id: RunId) -> Result<RunOutcome> {
        let outcome = {
            let runs = self.runs.lock().await;
            runs.get(&run_id)
                .ok_or(OrchestratorError::UnknownRun(run_id))?
                .outcome
                .clone()
        };
        outcome
            .await
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("run task failed: {}", e)))
    }

    /// Ids of every run launched through this orchestrator.
    pub async fn run_ids(&self) -> Vec<RunId> {
        self.runs.lock().await.keys().copied().collect()
    }
}
