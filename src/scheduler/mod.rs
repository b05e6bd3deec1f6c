//! Run execution: dispatch, barriers, repair and run bookkeeping.

mod events;
mod runner;
mod status;

pub use events::RunEvent;
pub use runner::{
    RunControl, RunError, RunOutcome, RunPlan, RunProgress, Scheduler, SchedulerConfig,
    SnapshotRef,
};
pub use status::{ExecutionTimer, RunSummary, StageRecord, StageStatus};
