//! Run report display (`cascade status`).

use anyhow::{Context, Result, bail};
use cascade::config::CascadeConfig;
use cascade::scheduler::{RunOutcome, StageStatus};
use cascade::ui::format_duration;
use std::path::{Path, PathBuf};

pub fn cmd_status(config: &CascadeConfig, run: &str, json: bool) -> Result<()> {
    let path = find_run_report(&config.runs_dir(), run)?;
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read run report: {}", path.display()))?;

    if json {
        println!("{}", content);
        return Ok(());
    }

    let outcome: RunOutcome = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse run report: {}", path.display()))?;
    print_report(&outcome);
    Ok(())
}

/// Locate `<runs_dir>/<id>.json` by full run id or unique prefix.
pub fn find_run_report(runs_dir: &Path, run: &str) -> Result<PathBuf> {
    let exact = runs_dir.join(format!("{}.json", run));
    if exact.exists() {
        return Ok(exact);
    }
    if !runs_dir.exists() {
        bail!("No runs recorded yet in {}", runs_dir.display());
    }

    let mut matches: Vec<PathBuf> = std::fs::read_dir(runs_dir)
        .with_context(|| format!("Failed to read directory: {}", runs_dir.display()))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().and_then(|e| e.to_str()) == Some("json")
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| stem.starts_with(run))
        })
        .collect();

    match matches.len() {
        0 => bail!("No run matches '{}'", run),
        1 => Ok(matches.remove(0)),
        n => bail!("Run prefix '{}' is ambiguous ({} matches)", run, n),
    }
}

fn print_report(outcome: &RunOutcome) {
    println!();
    println!("Run {} ({})", outcome.run_id, outcome.graph_id);
    println!("==========================================");
    println!("Status:      {}", outcome.status);
    if let Some(snapshot) = outcome.resumed_from {
        println!("Resumed from {}", snapshot);
    }
    println!(
        "Stages:      {}/{} completed, {} restored, {} failed, {} skipped in {}",
        outcome.summary.completed,
        outcome.summary.total_stages,
        outcome.summary.restored,
        outcome.summary.failed,
        outcome.summary.skipped,
        format_duration(outcome.summary.duration)
    );
    println!("Validations: {} (repairs: {})", outcome.validations, outcome.retries);

    if let Some(validation) = &outcome.validation {
        println!();
        println!("Last validation: {}", validation.summary());
        for issue in &validation.issues {
            println!("  - {}", issue);
        }
    }

    if !outcome.errors.is_empty() {
        println!();
        println!("Errors:");
        for error in &outcome.errors {
            let scope = error.stage.as_deref().unwrap_or("run");
            let kind = if error.fatal { "fatal" } else { "branch" };
            println!("  - [{}] {} ({})", scope, error.message, kind);
        }
    }

    println!();
    println!("{:<24} {:<10} {:>5} {:>10}", "STAGE", "STATUS", "RUNS", "TIME");
    for record in &outcome.summary.stages {
        let detail = match &record.status {
            StageStatus::Failed { error } => format!("  {}", error),
            _ => String::new(),
        };
        println!(
            "{:<24} {:<10} {:>5} {:>10}{}",
            record.stage,
            record.status.label(),
            record.invocations,
            format_duration(record.duration),
            detail
        );
    }

    if !outcome.snapshots.is_empty() {
        println!();
        println!("Snapshots:");
        for snapshot in &outcome.snapshots {
            println!("  {}  {} (after {})", snapshot.id, snapshot.boundary, snapshot.stage);
        }
    }
    if let Some(artifact) = outcome.artifact {
        println!();
        println!("Artifact: {}", artifact);
    }
    println!();
}
