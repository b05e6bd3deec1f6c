//! Pipeline inspection (`cascade graph`).

use anyhow::Result;
use cascade::config::CascadeConfig;
use cascade::graph::{StageDescriptor, StageKind};
use cascade::pipelines;
use serde_json::json;

pub fn cmd_graph(config: &CascadeConfig, graph_id: &str, json: bool) -> Result<()> {
    let graphs = pipelines::builtin_graphs(config)?;
    let Some(graph) = graphs.iter().find(|g| g.id() == graph_id) else {
        anyhow::bail!(
            "Unknown graph '{}'. Available: {}",
            graph_id,
            pipelines::BUILTIN.join(", ")
        );
    };
    let waves = graph.compute_waves();

    if json {
        let stages: Vec<&StageDescriptor> = graph.nodes().iter().map(|n| &n.descriptor).collect();
        let doc = json!({
            "id": graph.id(),
            "stages": stages,
            "waves": waves,
            "validator": graph.validator_index().map(|i| graph.stage_id(i)),
            "repair_target": graph.repair_index().map(|i| graph.stage_id(i)),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!();
    println!("Graph '{}' ({} stages)", graph.id(), graph.len());
    println!();
    for (i, wave) in waves.iter().enumerate() {
        println!("Wave {}: {}", i + 1, wave.join(", "));
    }
    println!();
    let scheduler_config = config.scheduler_config();
    for node in graph.nodes() {
        let d = &node.descriptor;
        let kind = match node.kind {
            StageKind::Validator(_) => " [validator]",
            StageKind::Task(_) => "",
        };
        println!("{}{}", d.id, kind);
        if !d.reads.is_empty() {
            println!("  reads:      {}", d.reads.join(", "));
        }
        if !d.writes.is_empty() {
            println!("  writes:     {}", d.writes.join(", "));
        }
        if let Some(group) = &d.parallel_group {
            println!("  group:      {}", group);
        }
        if let Some(checkpoint) = &d.checkpoint {
            println!("  checkpoint: {}", checkpoint);
        }
        if let Some(timeout) = scheduler_config.timeout_for(d) {
            println!("  timeout:    {}s", timeout.as_secs());
        }
    }
    if let Some(policy) = graph.repair_policy() {
        println!();
        println!(
            "Repair: re-run '{}' up to {} time(s), pass at score >= {}",
            policy.repair_stage, policy.retry_budget, policy.threshold
        );
    }
    println!();
    Ok(())
}
