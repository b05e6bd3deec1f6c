//! Run executor: walks a pipeline graph over one run's state.
//!
//! Ready stages are spawned as tokio tasks; their results come back over an
//! mpsc channel to this loop, which is the only writer of the state store.
//! That makes the arrival order of results the merge order for accumulating
//! keys.

use super::events::RunEvent;
use super::status::{ExecutionTimer, RunSummary, StageRecord, StageStatus};
use crate::errors::{OrchestratorError, Result, StageError};
use crate::graph::{
    Assessment, BranchFailure, GroupId, JoinReport, PipelineGraph, StageDescriptor, StageId,
    StageIndex, StageInput, StageKind,
};
use crate::repair::{RepairDecision, RepairLoop};
use crate::snapshot::{BoundaryRecord, SnapshotCache};
use crate::state::{HistoryEntry, KeyPolicy, PartialState, State, StateStore};
use crate::util::glob_match;
use cascade_common::{ArtifactId, Issue, RunId, RunStatus, SnapshotId, ValidationResult};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler settings that apply to every run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timeout for stages without their own or a pattern override.
    pub default_timeout: Option<Duration>,
    /// `(glob pattern, timeout)` pairs matched against stage ids, first wins.
    pub stage_timeouts: Vec<(String, Duration)>,
    /// Snapshot automatically after every join stage.
    pub snapshot_joins: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            stage_timeouts: Vec::new(),
            snapshot_joins: true,
        }
    }
}

impl SchedulerConfig {
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_stage_timeout(mut self, pattern: impl Into<String>, timeout: Duration) -> Self {
        self.stage_timeouts.push((pattern.into(), timeout));
        self
    }

    pub fn with_snapshot_joins(mut self, enabled: bool) -> Self {
        self.snapshot_joins = enabled;
        self
    }

    /// Descriptor timeout, else first matching pattern, else the default.
    pub fn timeout_for(&self, descriptor: &StageDescriptor) -> Option<Duration> {
        descriptor
            .timeout
            .or_else(|| {
                self.stage_timeouts
                    .iter()
                    .find(|(pattern, _)| glob_match(pattern, &descriptor.id))
                    .map(|(_, timeout)| *timeout)
            })
            .or(self.default_timeout)
    }
}

/// Everything needed to start executing a run.
#[derive(Debug)]
pub struct RunPlan {
    pub run_id: RunId,
    pub graph: Arc<PipelineGraph>,
    pub store: StateStore,
    /// Stages whose output was carried over from a snapshot.
    pub restored: BTreeSet<StageIndex>,
    pub resumed_from: Option<SnapshotId>,
    /// Branch outcomes and last validation of the restored stages.
    pub record: BoundaryRecord,
}

impl RunPlan {
    /// A new run from scratch with `input` seeded into the store.
    pub fn fresh(graph: Arc<PipelineGraph>, input: PartialState) -> Result<Self> {
        let mut store = StateStore::new(graph.key_policies().clone());
        store.seed(input)?;
        Ok(Self {
            run_id: RunId::new(),
            graph,
            store,
            restored: BTreeSet::new(),
            resumed_from: None,
            record: BoundaryRecord::default(),
        })
    }
}

/// External controls for one run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    /// Cancels the run at the next stage boundary.
    pub cancel: CancellationToken,
    /// Receives live progress for status queries.
    pub progress: Option<watch::Sender<RunProgress>>,
}

/// Live view of a run while it executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub status: RunStatus,
    pub retries: u32,
    pub last_validation: Option<ValidationResult>,
    pub errors: Vec<RunError>,
    pub completed_stages: usize,
    pub total_stages: usize,
}

/// An error recorded on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    pub message: String,
    /// Whether this error ended the run.
    pub fatal: bool,
}

/// Reference to a snapshot taken during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: SnapshotId,
    pub boundary: String,
    pub stage: StageId,
}

/// Terminal result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub graph_id: String,
    pub status: RunStatus,
    pub state: State,
    pub validation: Option<ValidationResult>,
    pub validations: u32,
    pub retries: u32,
    pub errors: Vec<RunError>,
    pub summary: RunSummary,
    pub snapshots: Vec<SnapshotRef>,
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<SnapshotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactId>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Latest snapshot taken at `boundary`.
    pub fn snapshot(&self, boundary: &str) -> Option<SnapshotId> {
        self.snapshots
            .iter()
            .rfind(|s| s.boundary == boundary)
            .map(|s| s.id)
    }

    pub fn fatal_error(&self) -> Option<&RunError> {
        self.errors.iter().find(|e| e.fatal)
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            status: self.status,
            retries: self.retries,
            last_validation: self.validation.clone(),
            errors: self.errors.clone(),
            completed_stages: self.summary.completed + self.summary.restored,
            total_stages: self.summary.total_stages,
        }
    }
}

/// Executes pipeline graphs.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
    snapshots: Option<Arc<SnapshotCache>>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            snapshots: None,
            event_tx: None,
        }
    }

    /// Take snapshots into this cache and allow resuming from it.
    pub fn with_snapshot_cache(mut self, cache: Arc<SnapshotCache>) -> Self {
        self.snapshots = Some(cache);
        self
    }

    /// Set the event channel for progress updates. The receiver must be drained.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run `graph` from scratch over `input`.
    pub async fn run(&self, graph: Arc<PipelineGraph>, input: PartialState) -> Result<RunOutcome> {
        let plan = RunPlan::fresh(graph, input)?;
        Ok(self.execute(plan, RunControl::default()).await)
    }

    /// Start a new run from a snapshot in the configured cache.
    pub async fn resume(
        &self,
        graph: Arc<PipelineGraph>,
        snapshot: SnapshotId,
        overrides: PartialState,
    ) -> Result<RunOutcome> {
        let cache = self
            .snapshots
            .as_ref()
            .ok_or(OrchestratorError::SnapshotNotFound(snapshot))?;
        let plan = cache.resume_plan(snapshot, graph, overrides)?;
        Ok(self.execute(plan, RunControl::default()).await)
    }

    /// Execute a prepared run to a terminal status.
    ///
    /// Never fails: stage errors, conflicts and cancellation all end up in
    /// the returned outcome.
    pub async fn execute(&self, plan: RunPlan, control: RunControl) -> RunOutcome {
        let timer = ExecutionTimer::start();
        let cancel = control.cancel.clone();
        let (tx, mut rx) = mpsc::channel::<Completion>(64);
        let mut run = Execution::new(self, plan, control, tx);

        info!(
            run_id = %run.run_id,
            graph = %run.graph.id(),
            stages = run.graph.len(),
            restored = run.restored_count(),
            "run started"
        );
        run.emit(RunEvent::RunStarted {
            run_id: run.run_id,
            graph: run.graph.id().to_string(),
            stages: run.graph.len(),
            resumed_from: run.resumed_from,
        })
        .await;
        run.publish();

        loop {
            if cancel.is_cancelled() {
                run.cancel();
                break;
            }

            run.dispatch_ready().await;
            if run.outcome.is_some() || run.active.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    run.cancel();
                    break;
                }
                Some(done) = rx.recv() => run.handle(done).await,
            }

            if run.outcome.is_some() {
                break;
            }
        }

        run.finish(timer).await
    }
}

struct Completion {
    index: StageIndex,
    epoch: u64,
    result: TaskResult,
}

enum TaskResult {
    Stage(std::result::Result<PartialState, StageError>),
    Validation(std::result::Result<Assessment, StageError>),
}

struct RepairRequest {
    feedback: Vec<Issue>,
    previous_output: PartialState,
}

/// Mutable bookkeeping for one run.
struct Execution<'a> {
    scheduler: &'a Scheduler,
    run_id: RunId,
    graph: Arc<PipelineGraph>,
    store: StateStore,
    resumed_from: Option<SnapshotId>,
    control: RunControl,
    tx: mpsc::Sender<Completion>,

    status: Vec<StageStatus>,
    invocations: Vec<u32>,
    durations: Vec<Duration>,
    started: Vec<Option<std::time::Instant>>,
    /// Bumped whenever a stage is reset; stale results are discarded.
    epochs: Vec<u64>,
    active: HashMap<StageIndex, JoinHandle<()>>,

    /// Successful group members in arrival order.
    arrivals: BTreeMap<GroupId, Vec<StageIndex>>,
    failures: BTreeMap<GroupId, Vec<BranchFailure>>,
    joined: BTreeSet<GroupId>,

    repair: Option<RepairLoop>,
    pending_repair: Option<RepairRequest>,
    live_status: RunStatus,
    outcome: Option<RunStatus>,
    errors: Vec<RunError>,
    snapshots: Vec<SnapshotRef>,
}

impl<'a> Execution<'a> {
    fn new(
        scheduler: &'a Scheduler,
        plan: RunPlan,
        control: RunControl,
        tx: mpsc::Sender<Completion>,
    ) -> Self {
        let len = plan.graph.len();
        let status = (0..len)
            .map(|i| {
                if plan.restored.contains(&i) {
                    StageStatus::Restored
                } else {
                    StageStatus::Pending
                }
            })
            .collect();
        let repair = plan.graph.repair_policy().map(|policy| {
            RepairLoop::new(policy.clone()).with_previous(plan.record.validation.clone())
        });

        let mut arrivals = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for report in &plan.record.joins {
            let completed: Vec<StageIndex> = report
                .completed
                .iter()
                .filter_map(|stage| plan.graph.index_of(stage))
                .collect();
            arrivals.insert(report.group.clone(), completed);
            failures.insert(report.group.clone(), report.failed.clone());
        }
        let joined: BTreeSet<GroupId> = plan
            .graph
            .groups()
            .filter(|g| !g.members.is_empty() && g.members.iter().all(|m| plan.restored.contains(m)))
            .map(|g| g.id.clone())
            .collect();

        Self {
            scheduler,
            run_id: plan.run_id,
            graph: plan.graph,
            store: plan.store,
            resumed_from: plan.resumed_from,
            control,
            tx,
            status,
            invocations: vec![0; len],
            durations: vec![Duration::ZERO; len],
            started: vec![None; len],
            epochs: vec![0; len],
            active: HashMap::new(),
            arrivals,
            failures,
            joined,
            repair,
            pending_repair: None,
            live_status: RunStatus::Running,
            outcome: None,
            errors: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    fn restored_count(&self) -> usize {
        self.status
            .iter()
            .filter(|s| matches!(s, StageStatus::Restored))
            .count()
    }

    fn stage_id(&self, index: StageIndex) -> StageId {
        self.graph.stage_id(index).to_string()
    }

    /// Dispatch every ready stage until nothing new becomes ready.
    async fn dispatch_ready(&mut self) {
        loop {
            if self.outcome.is_some() {
                return;
            }
            let ready: Vec<StageIndex> = (0..self.graph.len())
                .filter(|&i| self.is_ready(i))
                .collect();
            if ready.is_empty() {
                return;
            }
            for index in ready {
                self.dispatch(index).await;
                if self.outcome.is_some() {
                    return;
                }
            }
        }
    }

    fn is_ready(&self, index: StageIndex) -> bool {
        if self.status[index] != StageStatus::Pending {
            return false;
        }
        let own_group = self
            .graph
            .descriptor(index)
            .and_then(|d| d.parallel_group.as_ref());
        self.graph.dependencies(index).iter().all(|&dep| {
            match &self.status[dep] {
                StageStatus::Completed | StageStatus::Restored => true,
                // a failed branch still counts as returned for its join
                StageStatus::Failed { .. } => {
                    let dep_group = self
                        .graph
                        .descriptor(dep)
                        .and_then(|d| d.parallel_group.as_ref());
                    dep_group.is_some() && dep_group != own_group
                }
                _ => false,
            }
        })
    }

    /// First declared read that is neither set nor explained by a failed branch.
    fn missing_input(&self, index: StageIndex) -> Option<String> {
        let descriptor = self.graph.descriptor(index)?;
        descriptor
            .reads
            .iter()
            .find(|key| {
                if self.store.contains(key) || self.graph.key_policy(key) == KeyPolicy::Accumulating {
                    return false;
                }
                let producers = self.graph.producers_of(key);
                producers.is_empty()
                    || !producers
                        .iter()
                        .all(|&p| matches!(self.status[p], StageStatus::Failed { .. }))
            })
            .cloned()
    }

    async fn dispatch(&mut self, index: StageIndex) {
        let graph = Arc::clone(&self.graph);
        let Some(node) = graph.node(index) else {
            return;
        };
        let stage_id = node.id().to_string();

        if let Some(key) = self.missing_input(index) {
            self.invocations[index] += 1;
            self.record_failure(index, StageError::missing_input(key)).await;
            return;
        }

        self.invocations[index] += 1;
        let attempt = self.invocations[index];
        let timeout = self.scheduler.config.timeout_for(&node.descriptor);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        self.status[index] = StageStatus::Running;
        self.started[index] = Some(std::time::Instant::now());
        debug!(run_id = %self.run_id, stage = %stage_id, attempt, "stage dispatched");
        self.emit(RunEvent::StageStarted {
            run_id: self.run_id,
            stage: stage_id,
            attempt,
        })
        .await;

        let tx = self.tx.clone();
        let epoch = self.epochs[index];
        let handle = match &node.kind {
            StageKind::Task(stage) => {
                let stage = Arc::clone(stage);
                let input = self.stage_input(index, deadline, attempt);
                tokio::spawn(async move {
                    let result = guarded(stage.run(input), timeout).await;
                    tx.send(Completion {
                        index,
                        epoch,
                        result: TaskResult::Stage(result),
                    })
                    .await
                    .ok();
                })
            }
            StageKind::Validator(validator) => {
                let validator = Arc::clone(validator);
                let state = self.store.view();
                tokio::spawn(async move {
                    let result = guarded(validator.validate(state), timeout).await;
                    tx.send(Completion {
                        index,
                        epoch,
                        result: TaskResult::Validation(result),
                    })
                    .await
                    .ok();
                })
            }
        };
        self.active.insert(index, handle);
    }

    fn stage_input(
        &self,
        index: StageIndex,
        deadline: Option<tokio::time::Instant>,
        attempt: u32,
    ) -> StageInput {
        let joins = self
            .graph
            .joined_groups(index)
            .into_iter()
            .map(|group| self.join_report(&group.id))
            .collect();

        let repair = self
            .pending_repair
            .as_ref()
            .filter(|_| self.graph.repair_index() == Some(index));

        StageInput {
            run_id: self.run_id,
            state: self.store.view(),
            deadline,
            joins,
            feedback: repair.map(|r| r.feedback.clone()).unwrap_or_default(),
            previous_output: repair.map(|r| r.previous_output.clone()),
            attempt,
        }
    }

    fn join_report(&self, group: &str) -> JoinReport {
        JoinReport {
            group: group.to_string(),
            completed: self
                .arrivals
                .get(group)
                .map(|members| members.iter().map(|&i| self.stage_id(i)).collect())
                .unwrap_or_default(),
            failed: self.failures.get(group).cloned().unwrap_or_default(),
        }
    }

    async fn handle(&mut self, done: Completion) {
        let Completion {
            index,
            epoch,
            result,
        } = done;
        if epoch != self.epochs[index] {
            debug!(run_id = %self.run_id, stage = %self.stage_id(index), "discarding stale result");
            return;
        }
        self.active.remove(&index);
        if self.status[index] != StageStatus::Running {
            return;
        }
        if let Some(started) = self.started[index].take() {
            self.durations[index] += started.elapsed();
        }

        match result {
            TaskResult::Stage(Ok(partial)) => self.apply_output(index, partial).await,
            TaskResult::Validation(Ok(assessment)) => self.apply_validation(index, assessment).await,
            TaskResult::Stage(Err(error)) | TaskResult::Validation(Err(error)) => {
                self.record_failure(index, error).await
            }
        }
        self.publish();
    }

    async fn apply_output(&mut self, index: StageIndex, partial: PartialState) {
        let graph = Arc::clone(&self.graph);
        let Some(descriptor) = graph.descriptor(index) else {
            return;
        };
        let stage_id = descriptor.id.clone();
        let group = descriptor.parallel_group.clone();

        if let Some(key) = partial.keys().find(|k| !descriptor.writes.contains(k)) {
            let err = OrchestratorError::UndeclaredWrite {
                stage: stage_id.clone(),
                key: key.clone(),
            };
            self.fail_run(Some(stage_id), err);
            return;
        }

        let keys: Vec<String> = partial.keys().cloned().collect();
        if let Err(err) = self.store.set_many(&stage_id, partial, group.as_deref()) {
            self.fail_run(Some(stage_id), err);
            return;
        }

        self.status[index] = StageStatus::Completed;
        if graph.repair_index() == Some(index) {
            self.pending_repair = None;
        }
        debug!(run_id = %self.run_id, stage = %stage_id, keys = ?keys, "stage completed");
        self.emit(RunEvent::StageCompleted {
            run_id: self.run_id,
            stage: stage_id,
            keys,
            duration_ms: self.durations[index].as_millis() as u64,
        })
        .await;

        if let Some(group) = group {
            self.arrivals.entry(group.clone()).or_default().push(index);
            self.check_group_joined(&group).await;
        }
        self.maybe_snapshot(index).await;
    }

    async fn apply_validation(&mut self, index: StageIndex, assessment: Assessment) {
        let Some(repair) = self.repair.as_mut() else {
            self.fail_run(
                Some(self.stage_id(index)),
                OrchestratorError::InvalidGraph("validator without repair policy".to_string()),
            );
            return;
        };
        let (result, decision) = repair.assess(assessment);
        let attempt = repair.validations();

        info!(
            run_id = %self.run_id,
            score = result.score,
            passed = result.passed,
            attempt,
            "validation completed"
        );
        self.emit(RunEvent::ValidationCompleted {
            run_id: self.run_id,
            attempt,
            result: result.clone(),
        })
        .await;

        match decision {
            RepairDecision::Proceed => {
                self.status[index] = StageStatus::Completed;
            }
            RepairDecision::Repair { retry, feedback } => {
                self.begin_repair(retry, feedback).await;
            }
            RepairDecision::Exhausted => {
                self.status[index] = StageStatus::Completed;
                warn!(
                    run_id = %self.run_id,
                    summary = %result.summary(),
                    "retry budget exhausted, finishing with warnings"
                );
                self.outcome = Some(RunStatus::CompletedWithWarnings);
            }
        }
    }

    /// Reset the repair stage and everything downstream of it.
    async fn begin_repair(&mut self, retry: u32, feedback: Vec<Issue>) {
        let graph = Arc::clone(&self.graph);
        let Some(repair_index) = graph.repair_index() else {
            return;
        };
        let repair_id = self.stage_id(repair_index);

        self.live_status = RunStatus::AwaitingRepair;
        self.publish();

        let previous_output = graph
            .descriptor(repair_index)
            .map(|d| self.store.stage_output(&d.id, &d.writes))
            .unwrap_or_default();

        let mut reset = graph.descendants(repair_index);
        reset.insert(repair_index);
        for &index in &reset {
            let Some(descriptor) = graph.descriptor(index) else {
                continue;
            };
            self.store
                .clear_stage_outputs(&descriptor.id, &descriptor.writes);
            if let Some(handle) = self.active.remove(&index) {
                handle.abort();
            }
            self.epochs[index] += 1;
            self.status[index] = StageStatus::Pending;
            self.started[index] = None;
            if let Some(group) = &descriptor.parallel_group {
                if let Some(members) = self.arrivals.get_mut(group) {
                    members.retain(|&m| m != index);
                }
                if let Some(failed) = self.failures.get_mut(group) {
                    failed.retain(|f| f.stage != descriptor.id);
                }
                self.joined.remove(group);
            }
        }

        info!(
            run_id = %self.run_id,
            stage = %repair_id,
            retry,
            issues = feedback.len(),
            reset = reset.len(),
            "repair started"
        );
        self.emit(RunEvent::RepairStarted {
            run_id: self.run_id,
            stage: repair_id,
            retry,
            issues: feedback.len(),
        })
        .await;

        self.pending_repair = Some(RepairRequest {
            feedback,
            previous_output,
        });
        self.live_status = RunStatus::Running;
    }

    async fn record_failure(&mut self, index: StageIndex, error: StageError) {
        let stage_id = self.stage_id(index);
        let group = self.graph.group_of(index).map(|g| (g.id.clone(), g.policy));

        match group {
            Some((group, policy)) => {
                self.mark_branch_failed(index, error).await;
                if policy.cancel_siblings_on_error {
                    self.cancel_siblings(&group, &stage_id).await;
                }
                self.check_group_joined(&group).await;
            }
            None => {
                self.status[index] = StageStatus::Failed {
                    error: error.clone(),
                };
                self.emit(RunEvent::StageFailed {
                    run_id: self.run_id,
                    stage: stage_id.clone(),
                    error: error.clone(),
                })
                .await;
                self.fail_run(
                    Some(stage_id.clone()),
                    OrchestratorError::Stage {
                        stage: stage_id,
                        source: error,
                    },
                );
            }
        }
    }

    /// Record a branch failure for the join. Not fatal to the run.
    async fn mark_branch_failed(&mut self, index: StageIndex, error: StageError) {
        let stage_id = self.stage_id(index);
        let Some(group) = self.graph.group_of(index).map(|g| g.id.clone()) else {
            return;
        };
        warn!(run_id = %self.run_id, stage = %stage_id, group = %group, error = %error, "branch failed");

        self.status[index] = StageStatus::Failed {
            error: error.clone(),
        };
        self.failures
            .entry(group)
            .or_default()
            .push(BranchFailure {
                stage: stage_id.clone(),
                error: error.clone(),
            });
        self.errors.push(RunError {
            stage: Some(stage_id.clone()),
            message: error.to_string(),
            fatal: false,
        });
        self.emit(RunEvent::StageFailed {
            run_id: self.run_id,
            stage: stage_id,
            error,
        })
        .await;
    }

    async fn cancel_siblings(&mut self, group: &str, failed: &str) {
        let members = self
            .graph
            .group(group)
            .map(|g| g.members.clone())
            .unwrap_or_default();
        for member in members {
            if !matches!(self.status[member], StageStatus::Pending | StageStatus::Running) {
                continue;
            }
            if let Some(handle) = self.active.remove(&member) {
                handle.abort();
            }
            self.epochs[member] += 1;
            if let Some(started) = self.started[member].take() {
                self.durations[member] += started.elapsed();
            }
            let error = StageError::SiblingFailed {
                sibling: failed.to_string(),
            };
            self.mark_branch_failed(member, error).await;
        }
    }

    async fn check_group_joined(&mut self, group: &str) {
        let Some(members) = self.graph.group(group).map(|g| g.members.clone()) else {
            return;
        };
        if self.joined.contains(group) || !members.iter().all(|&m| self.status[m].is_terminal()) {
            return;
        }
        self.joined.insert(group.to_string());

        let report = self.join_report(group);
        info!(
            run_id = %self.run_id,
            group = %group,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "parallel group joined"
        );
        self.emit(RunEvent::GroupJoined {
            run_id: self.run_id,
            group: group.to_string(),
            failed: report.failed_ids().into_iter().map(str::to_string).collect(),
            completed: report.completed,
        })
        .await;
    }

    fn boundary_record(&self) -> BoundaryRecord {
        let groups: BTreeSet<&GroupId> = self.arrivals.keys().chain(self.failures.keys()).collect();
        BoundaryRecord {
            joins: groups.into_iter().map(|g| self.join_report(g)).collect(),
            validation: self
                .repair
                .as_ref()
                .and_then(|r| r.last_result().cloned()),
        }
    }

    async fn maybe_snapshot(&mut self, index: StageIndex) {
        let Some(cache) = self.scheduler.snapshots.clone() else {
            return;
        };
        let graph = Arc::clone(&self.graph);
        let Some(descriptor) = graph.descriptor(index) else {
            return;
        };
        let boundary = match &descriptor.checkpoint {
            Some(name) => name.clone(),
            None if self.scheduler.config.snapshot_joins && graph.is_join(index) => {
                format!("after:{}", descriptor.id)
            }
            None => return,
        };

        match cache.snapshot_with_record(
            self.run_id,
            graph.id(),
            &boundary,
            &descriptor.id,
            self.store.clone(),
            self.boundary_record(),
        ) {
            Ok(id) => {
                self.snapshots.push(SnapshotRef {
                    id,
                    boundary: boundary.clone(),
                    stage: descriptor.id.clone(),
                });
                self.emit(RunEvent::SnapshotCreated {
                    run_id: self.run_id,
                    snapshot_id: id,
                    boundary,
                    stage: descriptor.id.clone(),
                })
                .await;
            }
            Err(err) => {
                warn!(run_id = %self.run_id, boundary = %boundary, error = %err, "snapshot failed");
                self.errors.push(RunError {
                    stage: Some(descriptor.id.clone()),
                    message: err.to_string(),
                    fatal: false,
                });
            }
        }
    }

    fn fail_run(&mut self, stage: Option<StageId>, err: OrchestratorError) {
        if self.outcome.is_some() {
            return;
        }
        error!(run_id = %self.run_id, stage = ?stage, error = %err, "run failed");
        self.errors.push(RunError {
            stage,
            message: err.to_string(),
            fatal: true,
        });
        self.outcome = Some(RunStatus::Failed);
        for (_, handle) in self.active.drain() {
            handle.abort();
        }
    }

    /// Stop at the current boundary. In-flight stages finish unobserved.
    fn cancel(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        info!(run_id = %self.run_id, in_flight = self.active.len(), "run cancelled");
        self.outcome = Some(RunStatus::Cancelled);
        self.active.clear();
    }

    async fn finish(mut self, timer: ExecutionTimer) -> RunOutcome {
        let status = match self.outcome {
            Some(status) => status,
            // Branch failures are terminal but non-fatal; the join already saw them.
            None if self.status.iter().all(StageStatus::is_terminal) => RunStatus::Completed,
            None => {
                let stuck: Vec<StageId> = (0..self.status.len())
                    .filter(|&i| !self.status[i].is_terminal())
                    .map(|i| self.stage_id(i))
                    .collect();
                self.errors.push(RunError {
                    stage: None,
                    message: format!("run stalled with unreachable stages: {:?}", stuck),
                    fatal: true,
                });
                RunStatus::Failed
            }
        };
        self.live_status = status;

        for (index, stage_status) in self.status.iter_mut().enumerate() {
            if matches!(stage_status, StageStatus::Pending | StageStatus::Running) {
                *stage_status = StageStatus::Skipped;
                if let Some(started) = self.started[index].take() {
                    self.durations[index] += started.elapsed();
                }
            }
        }

        let records = (0..self.graph.len())
            .map(|i| StageRecord {
                stage: self.stage_id(i),
                status: self.status[i].clone(),
                invocations: self.invocations[i],
                duration: self.durations[i],
            })
            .collect();
        let summary = RunSummary::from_records(records, timer.elapsed());

        info!(
            run_id = %self.run_id,
            status = %status,
            completed = summary.completed,
            failed = summary.failed,
            duration_ms = summary.duration.as_millis() as u64,
            "run finished"
        );
        self.emit(RunEvent::RunFinished {
            run_id: self.run_id,
            status,
            summary: summary.clone(),
        })
        .await;

        let (validation, validations, retries) = match &self.repair {
            Some(repair) => (
                repair.last_result().cloned(),
                repair.validations(),
                repair.retries(),
            ),
            None => (None, 0, 0),
        };

        let outcome = RunOutcome {
            run_id: self.run_id,
            graph_id: self.graph.id().to_string(),
            status,
            state: self.store.view(),
            validation,
            validations,
            retries,
            errors: self.errors,
            summary,
            snapshots: self.snapshots,
            history: self.store.history().to_vec(),
            resumed_from: self.resumed_from,
            artifact: None,
        };
        if let Some(progress) = &self.control.progress {
            progress.send_replace(outcome.progress());
        }
        outcome
    }

    fn publish(&self) {
        let Some(progress) = &self.control.progress else {
            return;
        };
        progress.send_replace(RunProgress {
            status: self.outcome.unwrap_or(self.live_status),
            retries: self.repair.as_ref().map_or(0, RepairLoop::retries),
            last_validation: self
                .repair
                .as_ref()
                .and_then(|r| r.last_result().cloned()),
            errors: self.errors.clone(),
            completed_stages: self.status.iter().filter(|s| s.is_success()).count(),
            total_stages: self.status.len(),
        });
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.scheduler.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Run a stage future under its timeout, turning panics into stage errors.
async fn guarded<T>(
    work: impl Future<Output = std::result::Result<T, StageError>>,
    timeout: Option<Duration>,
) -> std::result::Result<T, StageError> {
    let work = AssertUnwindSafe(work).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(StageError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        },
        None => work.await,
    };
    outcome.unwrap_or_else(|panic| {
        Err(StageError::Panicked {
            message: panic_message(panic.as_ref()),
        })
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, StageDescriptor, stage_fn, validator_fn};
    use crate::repair::RepairPolicy;
    use crate::state::partial;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn emit(key: &'static str, value: serde_json::Value) -> impl crate::graph::Stage + 'static {
        stage_fn(move |_| {
            let value = value.clone();
            async move { Ok(partial([(key, value)])) }
        })
    }

    #[test]
    fn test_timeout_resolution_order() {
        let config = SchedulerConfig::default()
            .with_default_timeout(Some(Duration::from_secs(60)))
            .with_stage_timeout("section.*", Duration::from_secs(5));

        let own = StageDescriptor::new("section.a").with_timeout(Duration::from_secs(1));
        assert_eq!(config.timeout_for(&own), Some(Duration::from_secs(1)));
        assert_eq!(
            config.timeout_for(&StageDescriptor::new("section.b")),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            config.timeout_for(&StageDescriptor::new("score")),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            SchedulerConfig::default().timeout_for(&StageDescriptor::new("score")),
            None
        );
    }

    #[tokio::test]
    async fn test_sequential_run_completes() {
        let graph = GraphBuilder::new("seq")
            .stage(StageDescriptor::new("a").writes(["x"]), emit("x", json!(1)))
            .stage(
                StageDescriptor::new("b").reads(["x"]).writes(["y"]),
                stage_fn(|input: StageInput| async move {
                    let x: i64 = input.state.get_as("x")?;
                    Ok(partial([("y", json!(x + 1))]))
                }),
            )
            .build()
            .unwrap();

        let outcome = Scheduler::default()
            .run(Arc::new(graph), PartialState::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.get("y"), Some(&json!(2)));
        assert_eq!(outcome.summary.completed, 2);
    }

    #[tokio::test]
    async fn test_sequential_failure_fails_run() {
        let graph = GraphBuilder::new("seq")
            .stage(
                StageDescriptor::new("a").writes(["x"]),
                stage_fn(|_| async { Err(StageError::failed("upstream down")) }),
            )
            .stage(StageDescriptor::new("b").reads(["x"]), emit("unused", json!(0)))
            .build()
            .unwrap();

        let outcome = Scheduler::default()
            .run(Arc::new(graph), PartialState::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.fatal_error().unwrap().message.contains("upstream down"));
        assert_eq!(
            outcome.summary.record("b").unwrap().status,
            StageStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_undeclared_write_fails_run() {
        let graph = GraphBuilder::new("g")
            .stage(StageDescriptor::new("a").writes(["x"]), emit("sneaky", json!(1)))
            .build()
            .unwrap();
        let outcome = Scheduler::default()
            .run(Arc::new(graph), PartialState::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.errors[0].message.contains("sneaky"));
        assert!(!outcome.state.contains("sneaky"));
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_invoking() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let graph = GraphBuilder::new("g")
            .stage(
                StageDescriptor::new("a").reads(["required"]).writes(["x"]),
                stage_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(PartialState::new()) }
                }),
            )
            .build()
            .unwrap();
        let outcome = Scheduler::default()
            .run(Arc::new(graph), PartialState::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(outcome.errors[0].message.contains("required"));
    }

    #[tokio::test]
    async fn test_timeout_is_branch_failure() {
        let graph = GraphBuilder::new("g")
            .accumulating("parts")
            .stage(
                StageDescriptor::new("fast").in_group("g").writes(["parts"]),
                emit("parts", json!("ok")),
            )
            .stage(
                StageDescriptor::new("slow")
                    .in_group("g")
                    .writes(["parts"])
                    .with_timeout(Duration::from_millis(20)),
                stage_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(partial([("parts", json!("late"))]))
                }),
            )
            .stage(
                StageDescriptor::new("join").reads(["parts"]).writes(["report"]),
                stage_fn(|input: StageInput| async move {
                    let report = input.join("g").cloned().unwrap_or_default();
                    Ok(partial([("report", serde_json::to_value(report).unwrap())]))
                }),
            )
            .build()
            .unwrap();

        let outcome = Scheduler::default()
            .run(Arc::new(graph), PartialState::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        let report: JoinReport =
            serde_json::from_value(outcome.state.get("report").unwrap().clone()).unwrap();
        assert_eq!(report.completed, vec!["fast"]);
        assert_eq!(report.failed[0].stage, "slow");
        assert!(report.failed[0].error.is_timeout());
    }

    #[tokio::test]
    async fn test_failing_branch_cancels_siblings() {
        let graph = GraphBuilder::new("g")
            .accumulating("parts")
            .stage(
                StageDescriptor::new("slow").in_group("g").writes(["parts"]),
                stage_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(partial([("parts", json!("late"))]))
                }),
            )
            .stage(
                StageDescriptor::new("bad").in_group("g").writes(["parts"]),
                stage_fn(|_| async { Err(StageError::failed("bad input")) }),
            )
            .stage(
                StageDescriptor::new("join").reads(["parts"]).writes(["report"]),
                stage_fn(|input: StageInput| async move {
                    let report = input.join("g").cloned().unwrap_or_default();
                    Ok(partial([("report", serde_json::to_value(report).unwrap())]))
                }),
            )
            .cancel_siblings_on_error("g", true)
            .build()
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            Scheduler::default().run(Arc::new(graph), PartialState::new()),
        )
        .await
        .expect("siblings should be cancelled instead of awaited")
        .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        let report: JoinReport =
            serde_json::from_value(outcome.state.get("report").unwrap().clone()).unwrap();
        assert!(report.completed.is_empty());
        let mut failed = report.failed_ids();
        failed.sort();
        assert_eq!(failed, vec!["bad", "slow"]);

        let slow = report.failed.iter().find(|f| f.stage == "slow").unwrap();
        assert!(matches!(&slow.error, StageError::SiblingFailed { sibling } if sibling == "bad"));
        assert_eq!(serde_json::to_value(&slow.error).unwrap()["kind"], "sibling_failed");
        assert!(outcome.state.branch_values("parts").is_empty());
    }

    #[tokio::test]
    async fn test_panicking_stage_is_recorded() {
        let graph = GraphBuilder::new("g")
            .stage(
                StageDescriptor::new("a").writes(["x"]),
                stage_fn(|_| async {
                    if true {
                        panic!("stage exploded");
                    }
                    Ok(PartialState::new())
                }),
            )
            .build()
            .unwrap();
        let outcome = Scheduler::default()
            .run(Arc::new(graph), PartialState::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.errors[0].message.contains("stage exploded"));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let graph = GraphBuilder::new("g")
            .stage(StageDescriptor::new("a").writes(["x"]), emit("x", json!(1)))
            .build()
            .unwrap();
        let plan = RunPlan::fresh(Arc::new(graph), PartialState::new()).unwrap();
        let control = RunControl::default();
        control.cancel.cancel();

        let outcome = Scheduler::default().execute(plan, control).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.summary.invocations("a"), 0);
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_result() {
        let graph = GraphBuilder::new("g")
            .stage(
                StageDescriptor::new("slow").writes(["x"]),
                stage_fn(|_| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(partial([("x", json!(1))]))
                }),
            )
            .build()
            .unwrap();
        let plan = RunPlan::fresh(Arc::new(graph), PartialState::new()).unwrap();
        let control = RunControl::default();
        let cancel = control.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome = Scheduler::default().execute(plan, control).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(!outcome.state.contains("x"));
        assert_eq!(outcome.summary.invocations("slow"), 1);
    }

    #[tokio::test]
    async fn test_repair_receives_feedback_and_previous_output() {
        let graph = GraphBuilder::new("g")
            .stage(
                StageDescriptor::new("draft").writes(["text"]),
                stage_fn(|input: StageInput| async move {
                    let text = match (&input.previous_output, input.feedback_for("text")) {
                        (Some(prev), Some(_)) => format!("{} (fixed)", prev["text"].as_str().unwrap_or("")),
                        _ => "draft".to_string(),
                    };
                    Ok(partial([("text", json!(text))]))
                }),
            )
            .validator(
                StageDescriptor::new("check").reads(["text"]),
                validator_fn(|state: State| async move {
                    let fixed = state
                        .get("text")
                        .and_then(|v| v.as_str())
                        .is_some_and(|t| t.ends_with("(fixed)"));
                    let issues = if fixed {
                        vec![]
                    } else {
                        vec![Issue::blocking("text", "needs fixing")]
                    };
                    Ok(Assessment::new(if fixed { 1.0 } else { 0.3 }, issues))
                }),
            )
            .repair(RepairPolicy::new("draft").with_retry_budget(2))
            .build()
            .unwrap();

        let outcome = Scheduler::default()
            .run(Arc::new(graph), PartialState::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.get("text"), Some(&json!("draft (fixed)")));
        assert_eq!(outcome.retries, 1);
        assert_eq!(outcome.validations, 2);
        assert_eq!(outcome.summary.invocations("draft"), 2);
        assert!(outcome.validation.unwrap().passed);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let graph = GraphBuilder::new("g")
            .stage(StageDescriptor::new("a").writes(["x"]), emit("x", json!(1)))
            .build()
            .unwrap();
        let (tx, mut rx) = mpsc::channel(32);
        let outcome = Scheduler::default()
            .with_event_channel(tx)
            .run(Arc::new(graph), PartialState::new())
            .await
            .unwrap();
        assert!(outcome.is_success());

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec!["run_started", "stage_started", "stage_completed", "run_finished"]
        );
    }

    #[tokio::test]
    async fn test_progress_published() {
        let graph = GraphBuilder::new("g")
            .stage(StageDescriptor::new("a").writes(["x"]), emit("x", json!(1)))
            .build()
            .unwrap();
        let (progress_tx, progress_rx) = watch::channel(RunProgress::default());
        let plan = RunPlan::fresh(Arc::new(graph), PartialState::new()).unwrap();
        let control = RunControl {
            cancel: CancellationToken::new(),
            progress: Some(progress_tx),
        };
        Scheduler::default().execute(plan, control).await;

        let progress = progress_rx.borrow().clone();
        assert_eq!(progress.status, RunStatus::Completed);
        assert_eq!(progress.completed_stages, 1);
        assert_eq!(progress.total_stages, 1);
    }

    #[tokio::test]
    async fn test_resume_requires_cache() {
        let graph = GraphBuilder::new("g").build().unwrap();
        let err = Scheduler::default()
            .resume(Arc::new(graph), SnapshotId::new(), PartialState::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SnapshotNotFound(_)));
    }
}
