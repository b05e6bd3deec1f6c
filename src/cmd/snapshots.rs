//! Snapshot inspection and maintenance (`cascade snapshots`).

use anyhow::Result;
use cascade::config::CascadeConfig;

use super::super::SnapshotsCommands;
use super::open_snapshot_cache;
use super::resume::resolve_snapshot;

pub fn cmd_snapshots(config: &CascadeConfig, command: Option<SnapshotsCommands>) -> Result<()> {
    let cache = open_snapshot_cache(config)?;

    match command {
        None | Some(SnapshotsCommands::List) => {
            let snapshots = cache.list()?;
            if snapshots.is_empty() {
                println!("No snapshots.");
                return Ok(());
            }
            println!(
                "{:<36}  {:<10} {:<20} {:<20} {:>4}  CREATED",
                "ID", "RUN", "GRAPH", "BOUNDARY", "KEYS"
            );
            for info in snapshots {
                println!(
                    "{:<36}  {:<10} {:<20} {:<20} {:>4}  {}",
                    info.id,
                    info.run_id.short(),
                    info.graph_id,
                    info.boundary,
                    info.keys,
                    info.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Some(SnapshotsCommands::Show { id }) => {
            let snapshot = cache.get(resolve_snapshot(&cache, &id)?)?;
            println!();
            println!("Snapshot {}", snapshot.id);
            println!("  run:      {}", snapshot.run_id);
            println!("  graph:    {}", snapshot.graph_id);
            println!("  boundary: {} (after {})", snapshot.boundary, snapshot.stage);
            println!("  created:  {}", snapshot.created_at.to_rfc3339());
            if let Some(ttl) = cache.ttl() {
                let expires = snapshot.created_at
                    + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
                println!("  expires:  {}", expires.to_rfc3339());
            }
            println!();
            println!("{}", serde_json::to_string_pretty(&snapshot.state())?);
        }
        Some(SnapshotsCommands::Invalidate { id }) => {
            let id = resolve_snapshot(&cache, &id)?;
            if cache.invalidate(id)? {
                println!("Invalidated snapshot {}", id);
            } else {
                println!("Snapshot {} not found", id);
            }
        }
        Some(SnapshotsCommands::Prune) => {
            let evicted = cache.evict_expired()?;
            println!("Pruned {} expired snapshot(s).", evicted);
        }
    }

    Ok(())
}
