//! Typed error hierarchy for the cascade orchestrator.
//!
//! Two enums cover the two layers:
//! - `OrchestratorError`: graph, state store, snapshot and run-level failures
//! - `StageError`: a single stage invocation's own failure, carried as data
//!   to join stages and run reports rather than aborting the scheduler

use cascade_common::{ArtifactId, RunId, SnapshotId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the orchestrator: state store, graph, snapshots and runs.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("State conflict on key '{key}': already written by '{existing}', rejected write from '{writer}'")]
    StateConflict {
        key: String,
        existing: String,
        writer: String,
    },

    #[error("State key '{0}' is not set")]
    MissingKey(String),

    #[error("Stage '{stage}' wrote key '{key}' outside its declared write-set")]
    UndeclaredWrite { stage: String, key: String },

    #[error("Accumulating key '{key}' written by '{writer}' outside a parallel group")]
    AccumulatingOutsideGroup { key: String, writer: String },

    #[error("Invalid override for key '{key}': {reason}")]
    InvalidOverride { key: String, reason: String },

    #[error("Snapshot {0} not found or evicted")]
    SnapshotNotFound(SnapshotId),

    #[error("Artifact {0} not found")]
    ArtifactNotFound(ArtifactId),

    #[error("Invalid pipeline graph: {0}")]
    InvalidGraph(String),

    #[error("Unknown graph '{0}'")]
    UnknownGraph(String),

    #[error("Unknown run {0}")]
    UnknownRun(RunId),

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("Failed to persist {what} at {path}: {source}")]
    Persistence {
        what: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failure of one stage invocation.
///
/// Recorded on the stage's branch and handed to join stages as data.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    #[error("{message}")]
    Failed { message: String },

    #[error("required input key '{key}' is not set")]
    MissingInput { key: String },

    #[error("exceeded deadline of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("cancelled after sibling '{sibling}' failed")]
    SiblingFailed { sibling: String },

    #[error("stage panicked: {message}")]
    Panicked { message: String },
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn missing_input(key: impl Into<String>) -> Self {
        Self::MissingInput { key: key.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
