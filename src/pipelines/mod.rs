//! Built-in pipelines shipped with the `cascade` binary.

pub mod report;

use crate::config::CascadeConfig;
use crate::errors::Result;
use crate::graph::PipelineGraph;

/// Ids of the built-in graphs.
pub const BUILTIN: &[&str] = &[report::GRAPH_ID];

/// Report settings resolved from configuration.
pub fn report_settings(config: &CascadeConfig) -> report::ReportSettings {
    report::ReportSettings {
        retry_budget: config.retry_budget(),
        threshold: config.validation_threshold(),
        sections_policy: config.toml.group_policy(report::SECTIONS_GROUP),
    }
}

/// Every built-in graph, configured from `config`.
pub fn builtin_graphs(config: &CascadeConfig) -> Result<Vec<PipelineGraph>> {
    Ok(vec![report::build(&report_settings(config))?])
}
