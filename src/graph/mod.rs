//! Stage graph: descriptors, stage traits and the validated graph.
//!
//! This module provides:
//! - [`StageDescriptor`]: read/write sets, group membership, checkpoint and
//!   timeout of a stage
//! - [`Stage`] / [`Validator`]: the async traits implementations plug into
//! - [`GraphBuilder`] / [`PipelineGraph`]: validated DAG with fork/join
//!   barriers, key policies and an optional repair policy

mod builder;
mod stage;

pub use builder::{
    GraphBuilder, GroupPolicy, ParallelGroup, PipelineGraph, StageIndex, StageKind, StageNode,
};
pub use stage::{
    Assessment, BranchFailure, FnStage, FnValidator, GroupId, JoinReport, Stage,
    StageDescriptor, StageId, StageInput, Validator, stage_fn, validator_fn,
};
