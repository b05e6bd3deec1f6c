//! Stage descriptors and the traits stage implementations plug in through.

use crate::errors::StageError;
use crate::state::{PartialState, State, StateKey};
use async_trait::async_trait;
use cascade_common::{Issue, RunId};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Identifier of a stage within a graph.
pub type StageId = String;

/// Identifier of a parallel group within a graph.
pub type GroupId = String;

/// Static description of one stage.
///
/// Dependencies are the union of `depends_on` and the producers of every key
/// in `reads`. A dependency on any member of a parallel group the stage does
/// not belong to becomes a dependency on the whole group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: StageId,
    #[serde(default)]
    pub reads: Vec<StateKey>,
    #[serde(default)]
    pub writes: Vec<StateKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<GroupId>,
    #[serde(default)]
    pub depends_on: Vec<StageId>,
    /// Named boundary: a snapshot is taken when this stage completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::util::option_duration_ms"
    )]
    pub timeout: Option<Duration>,
}

impl StageDescriptor {
    pub fn new(id: impl Into<StageId>) -> Self {
        Self {
            id: id.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            parallel_group: None,
            depends_on: Vec::new(),
            checkpoint: None,
            timeout: None,
        }
    }

    pub fn reads<K: Into<StateKey>>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.reads.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn writes<K: Into<StateKey>>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.writes.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn in_group(mut self, group: impl Into<GroupId>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn after<S: Into<StageId>>(mut self, stages: impl IntoIterator<Item = S>) -> Self {
        self.depends_on.extend(stages.into_iter().map(Into::into));
        self
    }

    pub fn checkpoint(mut self, name: impl Into<String>) -> Self {
        self.checkpoint = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel_group.is_some()
    }
}

/// Outcome of a parallel group as seen by its join stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinReport {
    pub group: GroupId,
    /// Members that succeeded, in the order their results arrived.
    pub completed: Vec<StageId>,
    pub failed: Vec<BranchFailure>,
}

impl JoinReport {
    /// At least one branch failed.
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.stage.as_str()).collect()
    }
}

/// A group member that returned an error instead of output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFailure {
    pub stage: StageId,
    pub error: StageError,
}

/// Everything a stage receives for one invocation.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub run_id: RunId,
    pub state: State,
    /// Invocation deadline when a timeout applies.
    pub deadline: Option<Instant>,
    /// One report per parallel group this stage joins.
    pub joins: Vec<JoinReport>,
    /// Validator issues, set only when this invocation is a repair.
    pub feedback: Vec<Issue>,
    /// Output of the previous invocation, set only when this is a repair.
    pub previous_output: Option<PartialState>,
    /// 1 for the first invocation within a run, incremented per repair.
    pub attempt: u32,
}

impl StageInput {
    pub fn join(&self, group: &str) -> Option<&JoinReport> {
        self.joins.iter().find(|j| j.group == group)
    }

    pub fn is_repair(&self) -> bool {
        self.previous_output.is_some()
    }

    /// Feedback issue addressing `field`, if any.
    pub fn feedback_for(&self, field: &str) -> Option<&Issue> {
        self.feedback.iter().find(|i| i.field == field)
    }
}

/// A unit of pipeline work.
///
/// Implementations receive a copy of the state and return only the keys they
/// produce; the scheduler checks the result against the declared write-set.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, input: StageInput) -> Result<PartialState, StageError>;
}

/// Score and issues reported by a validator before thresholding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl Assessment {
    pub fn new(score: f64, issues: Vec<Issue>) -> Self {
        Self { score, issues }
    }
}

/// Scores the accumulated state and gates terminal success.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, state: State) -> Result<Assessment, StageError>;
}

/// Adapter turning an async closure into a [`Stage`].
pub struct FnStage<F> {
    f: F,
}

/// Wrap an async closure as a stage.
///
/// ```
/// use cascade::graph::stage_fn;
/// use cascade::state::partial;
/// use serde_json::json;
///
/// let stage = stage_fn(|_input| async { Ok(partial([("answer", json!(42))])) });
/// # let _ = stage;
/// ```
pub fn stage_fn<F, Fut>(f: F) -> FnStage<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PartialState, StageError>> + Send + 'static,
{
    FnStage { f }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PartialState, StageError>> + Send + 'static,
{
    async fn run(&self, input: StageInput) -> Result<PartialState, StageError> {
        (self.f)(input).await
    }
}

/// Adapter turning an async closure into a [`Validator`].
pub struct FnValidator<F> {
    f: F,
}

pub fn validator_fn<F, Fut>(f: F) -> FnValidator<F>
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Assessment, StageError>> + Send + 'static,
{
    FnValidator { f }
}

#[async_trait]
impl<F, Fut> Validator for FnValidator<F>
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Assessment, StageError>> + Send + 'static,
{
    async fn validate(&self, state: State) -> Result<Assessment, StageError> {
        (self.f)(state).await
    }
}
