//! Shared domain types for the cascade pipeline orchestrator.
//!
//! These types cross the boundary between the scheduler, the snapshot cache,
//! persisted run reports and anything embedding the orchestrator, so they are
//! kept free of runtime dependencies.

pub mod ids;
pub mod status;
pub mod validation;

pub use ids::{ArtifactId, IdParseError, RunId, SnapshotId};
pub use status::RunStatus;
pub use validation::{Issue, IssueSeverity, ValidationResult};
