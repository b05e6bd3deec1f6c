//! Bounded validate-and-repair loop.
//!
//! A graph may carry one validator stage and name an upstream repair stage.
//! Every validation pass goes through [`RepairLoop::assess`], which turns the
//! validator's [`Assessment`] into a [`ValidationResult`] and decides what
//! the scheduler does next:
//!
//! ```text
//! Validating ──passed──────────────────────────▶ Proceed
//!     │
//!     └─failed─┬─ retries < budget ─▶ Repair  (re-run repair stage + downstream)
//!              └─ retries = budget ─▶ Exhausted (completed-with-warnings)
//! ```
//!
//! At most `retry_budget + 1` validations happen per run.

use crate::graph::{Assessment, StageId};
use cascade_common::{Issue, ValidationResult};
use serde::{Deserialize, Serialize};

/// Default number of repair attempts after the first failed validation.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Default minimum score for a validation to pass.
pub const DEFAULT_THRESHOLD: f64 = 0.8;

/// How a graph's validator gates terminal success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairPolicy {
    /// Stage re-invoked with feedback when validation fails.
    pub repair_stage: StageId,
    pub threshold: f64,
    pub retry_budget: u32,
}

impl RepairPolicy {
    pub fn new(repair_stage: impl Into<StageId>) -> Self {
        Self {
            repair_stage: repair_stage.into(),
            threshold: DEFAULT_THRESHOLD,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }
}

/// What the scheduler should do after a validation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RepairDecision {
    /// Validation passed; continue to the stages after the validator.
    Proceed,
    /// Re-run the repair stage with these issues as feedback.
    Repair { retry: u32, feedback: Vec<Issue> },
    /// Validation failed with no budget left; finish with warnings.
    Exhausted,
}

impl RepairDecision {
    pub fn allows_progression(&self) -> bool {
        matches!(self, Self::Proceed)
    }

    pub fn requires_repair(&self) -> bool {
        matches!(self, Self::Repair { .. })
    }
}

/// Per-run repair bookkeeping.
#[derive(Debug, Clone)]
pub struct RepairLoop {
    policy: RepairPolicy,
    retries: u32,
    validations: u32,
    last: Option<ValidationResult>,
}

impl RepairLoop {
    pub fn new(policy: RepairPolicy) -> Self {
        Self {
            policy,
            retries: 0,
            validations: 0,
            last: None,
        }
    }

    /// Carry over the last validation of the run this one resumed from.
    /// It is reported until this run validates again.
    pub fn with_previous(mut self, last: Option<ValidationResult>) -> Self {
        self.last = last;
        self
    }

    /// Record one validation pass and decide the next step.
    pub fn assess(&mut self, assessment: Assessment) -> (ValidationResult, RepairDecision) {
        let result =
            ValidationResult::evaluate(assessment.score, assessment.issues, self.policy.threshold);
        self.validations += 1;
        self.last = Some(result.clone());

        let decision = if result.passed {
            RepairDecision::Proceed
        } else if self.retries < self.policy.retry_budget {
            self.retries += 1;
            RepairDecision::Repair {
                retry: self.retries,
                feedback: result.issues.clone(),
            }
        } else {
            RepairDecision::Exhausted
        };
        (result, decision)
    }

    pub fn policy(&self) -> &RepairPolicy {
        &self.policy
    }

    /// Repairs started so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn validations(&self) -> u32 {
        self.validations
    }

    pub fn remaining_budget(&self) -> u32 {
        self.policy.retry_budget.saturating_sub(self.retries)
    }

    pub fn last_result(&self) -> Option<&ValidationResult> {
        self.last.as_ref()
    }
}
