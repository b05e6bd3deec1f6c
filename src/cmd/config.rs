//! Configuration view and validation commands (`cascade config`).

use anyhow::Result;
use cascade::config::{CascadeConfig, CascadeToml, RETRY_BUDGET_ENV};
use cascade::telemetry::LOG_ENV;

use super::super::ConfigCommands;

pub fn cmd_config(config: &CascadeConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Cascade Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No cascade.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print_toml(&config.toml);

            println!("Effective values (with env/CLI overrides):");
            println!("  retry_budget = {}", config.retry_budget());
            println!("  log_level = \"{}\"", config.log_level());
            if let Ok(filter) = std::env::var(LOG_ENV) {
                println!("  {} = \"{}\" (overrides log_level)", LOG_ENV, filter);
            }
            if let Ok(budget) = std::env::var(RETRY_BUDGET_ENV) {
                println!("  {} = \"{}\"", RETRY_BUDGET_ENV, budget);
            }
            println!();
            if !config_path.exists() {
                println!("Run 'cascade config init' to create a cascade.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No cascade.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("cascade.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.cascade_dir)?;
            CascadeToml::default().save(&config_path)?;

            println!("Created cascade.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [run] retry_budget, validation_threshold, stage_timeout_secs");
            println!("  - [snapshots] ttl_secs, persist");
            println!("  - [stages.overrides.\"pattern-*\"] for stage-specific timeouts");
            println!("  - [groups.<id>] cancel_siblings_on_error");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &CascadeToml) {
    println!("[run]");
    println!("  retry_budget = {}", toml.run.retry_budget);
    println!("  validation_threshold = {}", toml.run.validation_threshold);
    match toml.run.stage_timeout_secs {
        Some(secs) => println!("  stage_timeout_secs = {}", secs),
        None => println!("  stage_timeout_secs = (none)"),
    }
    println!("  snapshot_joins = {}", toml.run.snapshot_joins);
    println!();

    println!("[snapshots]");
    match toml.snapshots.ttl_secs {
        Some(secs) => println!("  ttl_secs = {}", secs),
        None => println!("  ttl_secs = (never expire)"),
    }
    println!("  persist = {}", toml.snapshots.persist);
    println!();

    if !toml.stages.overrides.is_empty() {
        println!("[stages.overrides]");
        for (pattern, override_cfg) in &toml.stages.overrides {
            println!("  \"{}\":", pattern);
            if let Some(secs) = override_cfg.timeout_secs {
                println!("    timeout_secs = {}", secs);
            }
        }
        println!();
    }

    for (group, policy) in &toml.groups {
        println!("[groups.{}]", group);
        println!("  cancel_siblings_on_error = {}", policy.cancel_siblings_on_error);
        println!();
    }

    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  format = \"{}\"", toml.logging.format);
    println!();
}
