//! Validation results produced by a pipeline's validator stage.
//!
//! A [`ValidationResult`] gates terminal success: it passes only when the
//! score reaches the configured threshold *and* no issue is blocking.
//!
//! # Example
//!
//! ```
//! use cascade_common::{Issue, ValidationResult};
//!
//! let result = ValidationResult::evaluate(
//!     0.9,
//!     vec![Issue::advisory("report.summary", "summary is terse")],
//!     0.8,
//! );
//! assert!(result.passed);
//!
//! let blocked = ValidationResult::evaluate(
//!     0.95,
//!     vec![Issue::blocking("report.recommendations", "missing")],
//!     0.8,
//! );
//! assert!(!blocked.passed);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// How much an issue matters to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Fails validation regardless of score.
    Blocking,
    /// Reported, but does not fail validation on its own.
    #[default]
    Advisory,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => write!(f, "blocking"),
            Self::Advisory => write!(f, "advisory"),
        }
    }
}

/// A single problem found by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    /// State key or dotted path inside a value the issue refers to.
    pub field: String,
    pub message: String,
}

impl Issue {
    pub fn new(severity: IssueSeverity, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn blocking(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Blocking, field, message)
    }

    pub fn advisory(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Advisory, field, message)
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == IssueSeverity::Blocking
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.field, self.message)
    }
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Score in `[0.0, 1.0]`.
    pub score: f64,
    pub issues: Vec<Issue>,
    /// Threshold the score was compared against.
    pub threshold: f64,
    pub passed: bool,
}

impl ValidationResult {
    /// Build a result, clamping the score into range and deriving `passed`.
    ///
    /// A NaN score is treated as `0.0`.
    pub fn evaluate(score: f64, issues: Vec<Issue>, threshold: f64) -> Self {
        let score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        };
        let passed = score >= threshold && !issues.iter().any(Issue::is_blocking);
        Self {
            score,
            issues,
            threshold,
            passed,
        }
    }

    pub fn blocking_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }

    pub fn advisory_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| !i.is_blocking())
    }

    /// One-line summary, e.g. `score 0.62/0.80, 1 blocking, 2 advisory`.
    pub fn summary(&self) -> String {
        format!(
            "score {:.2}/{:.2}, {} blocking, {} advisory",
            self.score,
            self.threshold,
            self.blocking_issues().count(),
            self.advisory_issues().count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_requires_threshold() {
        assert!(ValidationResult::evaluate(0.8, vec![], 0.8).passed);
        assert!(!ValidationResult::evaluate(0.79, vec![], 0.8).passed);
    }

    #[test]
    fn test_blocking_issue_fails_high_score() {
        let result = ValidationResult::evaluate(1.0, vec![Issue::blocking("x", "bad")], 0.5);
        assert!(!result.passed);
        assert_eq!(result.blocking_issues().count(), 1);
    }

    #[test]
    fn test_advisory_issue_does_not_block() {
        let result = ValidationResult::evaluate(0.9, vec![Issue::advisory("x", "meh")], 0.5);
        assert!(result.passed);
        assert_eq!(result.advisory_issues().count(), 1);
    }

    #[test]
    fn test_score_is_clamped() {
        assert_eq!(ValidationResult::evaluate(1.7, vec![], 0.5).score, 1.0);
        assert_eq!(ValidationResult::evaluate(-0.2, vec![], 0.5).score, 0.0);
        assert_eq!(ValidationResult::evaluate(f64::NAN, vec![], 0.5).score, 0.0);
    }

    #[test]
    fn test_summary_format() {
        let result = ValidationResult::evaluate(
            0.62,
            vec![Issue::blocking("a", "x"), Issue::advisory("b", "y")],
            0.8,
        );
        assert_eq!(result.summary(), "score 0.62/0.80, 1 blocking, 1 advisory");
    }

    #[test]
    fn test_issue_display() {
        let issue = Issue::blocking("report.recommendations", "missing");
        assert_eq!(issue.to_string(), "[blocking] report.recommendations: missing");
    }
}
