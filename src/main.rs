use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(version, about = "Multi-stage analysis pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log level or filter directive. CASCADE_LOG takes precedence.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Repairs allowed after a failed validation. Overrides cascade.toml and CASCADE_RETRY_BUDGET.
    #[arg(long, global = true)]
    pub retry_budget: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .cascade/ with a default cascade.toml
    Init,
    /// Run a pipeline over an input document
    Run {
        /// JSON object, inline or as a file path
        #[arg(short, long)]
        input: String,

        /// Pipeline to run
        #[arg(short, long, default_value = "report")]
        graph: String,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// Start a new run from a snapshot, optionally overriding keys
    Resume {
        snapshot: String,

        /// Override a state key: key=<json>. Repeatable.
        #[arg(long = "set", value_name = "KEY=JSON")]
        overrides: Vec<String>,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// Show the status of a finished run
    Status {
        /// Run id or unique prefix
        run: String,

        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and maintain snapshots
    Snapshots {
        #[command(subcommand)]
        command: Option<SnapshotsCommands>,
    },
    /// Show a pipeline's stages and execution waves
    Graph {
        #[arg(short, long, default_value = "report")]
        graph: String,

        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SnapshotsCommands {
    /// List live snapshots
    List,
    /// Show a snapshot's boundary and state
    Show { id: String },
    /// Delete a snapshot
    Invalidate { id: String },
    /// Delete expired snapshots
    Prune,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default cascade.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = cascade::config::CascadeConfig::with_cli_args(
        project_dir.clone(),
        cli.retry_budget,
        cli.log_level.clone(),
    )?;
    cascade::telemetry::init(config.log_level(), config.log_format());

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Run { input, graph, ui } => {
            cmd::cmd_run(&cli, &config, graph, input, ui).await?
        }
        Commands::Resume {
            snapshot,
            overrides,
            ui,
        } => cmd::cmd_resume(&cli, &config, snapshot, overrides, ui).await?,
        Commands::Status { run, json } => cmd::cmd_status(&config, run, *json)?,
        Commands::Snapshots { command } => cmd::cmd_snapshots(&config, command.clone())?,
        Commands::Graph { graph, json } => cmd::cmd_graph(&config, graph, *json)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
