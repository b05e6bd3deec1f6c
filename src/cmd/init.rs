//! Project initialization (`cascade init`).

use anyhow::Result;
use cascade::config::{CascadeConfig, CascadeToml};

pub fn cmd_init(config: &CascadeConfig) -> Result<()> {
    config.ensure_directories()?;

    let config_path = config.config_file();
    if config_path.exists() {
        println!("Already initialized: {}", config_path.display());
        return Ok(());
    }

    CascadeToml::default().save(&config_path)?;

    println!("Initialized cascade project in {}", config.cascade_dir.display());
    println!();
    println!("  config:    {}", config_path.display());
    println!("  snapshots: {}", config.snapshots_dir().display());
    println!("  runs:      {}", config.runs_dir().display());
    println!("  artifacts: {}", config.artifacts_dir().display());
    println!();
    println!("Next: cascade run --input '{{\"company\": {{...}}, \"metrics\": {{...}}}}'");
    Ok(())
}
