//! Stage-graph pipeline orchestration.
//!
//! A [`graph::PipelineGraph`] of stages is executed by the
//! [`scheduler::Scheduler`] over a shared [`state::StateStore`]. Parallel
//! groups fork and join, a validator can send the run back through a bounded
//! repair loop, and [`snapshot::SnapshotCache`] lets a later run resume from
//! any stage boundary. [`orchestrator::Orchestrator`] is the entry point for
//! starting, observing and cancelling runs.

pub mod config;
pub mod errors;
pub mod graph;
pub mod orchestrator;
pub mod persistence;
pub mod pipelines;
pub mod repair;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod telemetry;
pub mod ui;
pub mod util;
