//! Per-stage execution status and run summaries.

use crate::errors::StageError;
use crate::graph::StageId;
use crate::util::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Status of a stage within one run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Currently executing
    Running,
    /// Output merged into the run state
    Completed,
    /// Output carried over from the snapshot the run resumed from
    Restored,
    /// Returned an error, timed out or was cancelled with its siblings
    Failed { error: StageError },
    /// Never ran because the run stopped first
    Skipped,
}

impl StageStatus {
    /// No further transitions happen from a terminal status within an epoch.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Dependents may treat this stage's output as available.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Restored)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Restored => "restored",
            Self::Failed { .. } => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Final record for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageId,
    pub status: StageStatus,
    /// Number of times the stage was invoked in this run.
    pub invocations: u32,
    /// Total time spent across invocations.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Summary of a run's stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_stages: usize,
    pub completed: usize,
    pub restored: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
}

impl RunSummary {
    pub fn from_records(stages: Vec<StageRecord>, duration: Duration) -> Self {
        let count = |f: fn(&StageStatus) -> bool| stages.iter().filter(|r| f(&r.status)).count();
        Self {
            total_stages: stages.len(),
            completed: count(|s| matches!(s, StageStatus::Completed)),
            restored: count(|s| matches!(s, StageStatus::Restored)),
            failed: count(|s| matches!(s, StageStatus::Failed { .. })),
            skipped: count(|s| matches!(s, StageStatus::Skipped)),
            duration,
            stages,
        }
    }

    pub fn record(&self, stage: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Invocation count for a stage, 0 when unknown.
    pub fn invocations(&self, stage: &str) -> u32 {
        self.record(stage).map_or(0, |r| r.invocations)
    }

    pub fn total_invocations(&self) -> u32 {
        self.stages.iter().map(|r| r.invocations).sum()
    }

    /// Share of stages whose output is available, as a percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.total_stages == 0 {
            return 100.0;
        }
        ((self.completed + self.restored) as f64 / self.total_stages as f64) * 100.0
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stage: &str, status: StageStatus, invocations: u32) -> StageRecord {
        StageRecord {
            stage: stage.to_string(),
            status,
            invocations,
            duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_stage_status_terminal() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Restored.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(
            StageStatus::Failed {
                error: StageError::failed("x")
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_restored_counts_as_success() {
        assert!(StageStatus::Restored.is_success());
        assert!(!StageStatus::Skipped.is_success());
    }

    #[test]
    fn test_run_summary_counts() {
        let summary = RunSummary::from_records(
            vec![
                record("a", StageStatus::Restored, 0),
                record("b", StageStatus::Completed, 2),
                record(
                    "c",
                    StageStatus::Failed {
                        error: StageError::failed("boom"),
                    },
                    1,
                ),
                record("d", StageStatus::Skipped, 0),
            ],
            Duration::from_secs(1),
        );
        assert_eq!(summary.total_stages, 4);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.restored, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.invocations("b"), 2);
        assert_eq!(summary.invocations("zzz"), 0);
        assert_eq!(summary.total_invocations(), 3);
        assert_eq!(summary.completion_percentage(), 50.0);
    }

    #[test]
    fn test_stage_status_serde_tag() {
        let json = serde_json::to_value(StageStatus::Failed {
            error: StageError::Timeout { timeout_ms: 5 },
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"]["kind"], "timeout");
    }
}
