//! Events emitted while a run executes.

use crate::errors::StageError;
use crate::graph::{GroupId, StageId};
use crate::scheduler::RunSummary;
use crate::state::StateKey;
use cascade_common::{RunId, RunStatus, SnapshotId, ValidationResult};
use serde::{Deserialize, Serialize};

/// Progress events, delivered in scheduler order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        graph: String,
        stages: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resumed_from: Option<SnapshotId>,
    },
    StageStarted {
        run_id: RunId,
        stage: StageId,
        attempt: u32,
    },
    StageCompleted {
        run_id: RunId,
        stage: StageId,
        keys: Vec<StateKey>,
        duration_ms: u64,
    },
    StageFailed {
        run_id: RunId,
        stage: StageId,
        error: StageError,
    },
    /// Every member of a parallel group has returned.
    GroupJoined {
        run_id: RunId,
        group: GroupId,
        completed: Vec<StageId>,
        failed: Vec<StageId>,
    },
    SnapshotCreated {
        run_id: RunId,
        snapshot_id: SnapshotId,
        boundary: String,
        stage: StageId,
    },
    ValidationCompleted {
        run_id: RunId,
        attempt: u32,
        result: ValidationResult,
    },
    RepairStarted {
        run_id: RunId,
        stage: StageId,
        retry: u32,
        issues: usize,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        summary: RunSummary,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageCompleted { run_id, .. }
            | Self::StageFailed { run_id, .. }
            | Self::GroupJoined { run_id, .. }
            | Self::SnapshotCreated { run_id, .. }
            | Self::ValidationCompleted { run_id, .. }
            | Self::RepairStarted { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let run_id = RunId::new();
        let event = RunEvent::StageStarted {
            run_id,
            stage: "score".into(),
            attempt: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage_started");
        assert_eq!(json["attempt"], 2);
        assert_eq!(event.run_id(), run_id);
    }

    #[test]
    fn test_run_started_omits_missing_snapshot() {
        let json = serde_json::to_value(RunEvent::RunStarted {
            run_id: RunId::new(),
            graph: "g".into(),
            stages: 3,
            resumed_from: None,
        })
        .unwrap();
        assert!(json.get("resumed_from").is_none());
    }
}
