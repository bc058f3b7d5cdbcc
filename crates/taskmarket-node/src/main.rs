use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taskmarket_node::{init_logging, MarketNode, NodeConfig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "taskmarket-node")]
#[command(about = "Agent task market engine", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TASKMARKET_CONFIG")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl-C
    Start,
    /// Write the default configuration to a file
    InitConfig {
        #[arg(default_value = "taskmarket.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::InitConfig { path }) = &cli.command {
        NodeConfig::default()
            .save_to_file(path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = NodeConfig::load(cli.config.as_deref())?;
    init_logging(&config.logging, cli.verbose)?;

    if cli.config.is_none() {
        warn!("No config file given, using defaults");
    }

    let node = MarketNode::from_config(config)?;
    let report = node
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await?;

    info!(
        total_tasks = report.stats.total_tasks,
        events_logged = report.events_logged,
        "Shutdown complete"
    );
    Ok(())
}
