//! Lifecycle status of a pipeline run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one run.
///
/// `AwaitingRepair` is transient: it is published between a failed validation
/// and the re-dispatch of the repair stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    #[default]
    Running,
    AwaitingRepair,
    Completed,
    /// Validation never passed within the retry budget. Not a failure.
    CompletedWithWarnings,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// No further transitions happen from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithWarnings | Self::Failed | Self::Cancelled
        )
    }

    /// The run produced a final state (possibly with warnings).
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithWarnings)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingRepair => "awaiting-repair",
            Self::Completed => "completed",
            Self::CompletedWithWarnings => "completed-with-warnings",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::AwaitingRepair.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::CompletedWithWarnings.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_warnings_count_as_success() {
        assert!(RunStatus::CompletedWithWarnings.is_success());
        assert!(!RunStatus::Failed.is_success());
        assert!(!RunStatus::Cancelled.is_success());
    }

    #[test]
    fn test_serde_matches_display() {
        for status in [
            RunStatus::Running,
            RunStatus::AwaitingRepair,
            RunStatus::CompletedWithWarnings,
            RunStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }
}
