//! expkit CLI: run-directory setup, multi-rank launch and multimodal export.

mod commands;
mod launch;

use clap::Parser;
use expkit_core::LogSinks;
use std::path::PathBuf;
use std::sync::Arc;

/// expkit: experiment run orchestration for distributed training
#[derive(Parser, Debug)]
#[command(name = "expkit", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (searched for expkit.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Resolve and create this rank's run directory, printing the run state as JSON
    Setup {
        /// Reuse the unversioned experiment directory
        #[arg(long)]
        resume: bool,
        /// Defaults to $NODE_RANK, then 0
        #[arg(long)]
        node_rank: Option<usize>,
        /// Processes per node; defaults to $WORLD_SIZE, then 1
        #[arg(long)]
        world_size: Option<usize>,
        /// Treat the target as a lightweight fabric launcher
        #[arg(long)]
        fabric: bool,
        /// Metric monitored by the checkpoint callback
        #[arg(long)]
        monitor: Option<String>,
    },
    /// Print a fresh datetime run version
    Version,
    /// Spawn one process per local rank with a shared, precomputed run version
    Launch {
        /// Processes to start on this node
        #[arg(long, default_value_t = 1)]
        nproc: usize,
        #[arg(long, default_value_t = 0)]
        node_rank: usize,
        #[arg(long, default_value_t = 1)]
        nnodes: usize,
        /// Run version; generated when omitted
        #[arg(long)]
        run_version: Option<String>,
        /// Command to run for every rank
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Export a visual encoder and language model checkpoint pair into inference engines
    ExportMultimodal {
        /// Export configuration (TOML)
        #[arg(long)]
        export_config: PathBuf,
        /// Load the built engines once export finishes
        #[arg(long)]
        load_model: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default expkit.toml into the workspace
    Init,
    /// Show the resolved configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = expkit_core::load_config(Some(&workspace), cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {e}"))?;

    config.logging.level = match cli.verbose {
        0 if cli.quiet => "error".to_string(),
        0 => config.logging.level,
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let logging: Arc<dyn LogSinks> = Arc::new(expkit_core::init_logging(&config.logging)?);

    commands::handle_command(cli.command, &workspace, config, logging).await
}
