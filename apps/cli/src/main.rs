use anyhow::{Context, Result};
use cap_resilience::{Resilience, ResilienceConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod simulate;

use simulate::Simulate;

#[derive(Parser)]
#[command(name = "cap-resilience")]
#[command(about = "Adaptive quality and loopback failover for live video", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config file and open every fallback source it lists
    Check {
        config: PathBuf,

        #[arg(long)]
        json: bool,
    },
    /// Drive a synthetic producer and consumer through a stall
    Simulate(Simulate),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    match cli.command {
        Commands::Check { config, json } => {
            cmd_check(&config, json)?;
        }

        Commands::Simulate(simulate) => {
            simulate.run().await?;
        }
    }

    Ok(())
}

fn cmd_check(path: &Path, json_output: bool) -> Result<()> {
    let config = ResilienceConfig::load(path)
        .with_context(|| format!("Failed to load config '{}'", path.display()))?;
    let resilience = Resilience::new(config)?;
    let status = resilience.status();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Config '{}' is valid", path.display());
    println!(
        "  quality:  {} strategy, starting at {:.2}",
        status.quality.strategy, status.quality_value
    );
    println!(
        "  loopback: {} mode, {} sources",
        status.loopback.mode,
        status.loopback.sources.len()
    );
    for source in &status.loopback.sources {
        println!(
            "    {:<20} {:<15} priority {:>3}{}",
            source.name,
            source.kind.to_string(),
            source.priority,
            if source.enabled { "" } else { "  (disabled)" }
        );
    }

    Ok(())
}
