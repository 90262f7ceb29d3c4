use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use schedwatch_engine::{Engine, EngineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "schedwatch")]
#[command(about = "Tournament schedule page monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the cron-driven dispatch loop until interrupted.
    Run,
    /// Claim everything currently due and check it once, inline.
    Tick,
    /// Import targets from a YAML seed file.
    Seed { path: PathBuf },
    /// List monitored targets.
    List,
    /// Show the check history for one target.
    History { target_id: uuid::Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let engine = Arc::new(Engine::new(EngineConfig::from_env())?);

    match cli.command.unwrap_or(Commands::Tick) {
        Commands::Run => {
            let sched = engine.build_scheduler().await?;
            sched.start().await?;
            tracing::info!("dispatch loop running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
        }
        Commands::Tick => {
            let summary = engine.tick_now().await?;
            println!(
                "tick complete: claimed={} completed={} fetch_failed={} skipped={} errored={}",
                summary.claimed,
                summary.completed,
                summary.fetch_failed,
                summary.skipped,
                summary.errored
            );
        }
        Commands::Seed { path } => {
            let imported = engine.seed_from_file(&path).await?;
            println!("imported {} target(s)", imported.len());
            for target in imported {
                println!("  {}  {}  {}", target.id, target.name, target.url);
            }
        }
        Commands::List => {
            for summary in engine.target_summaries().await? {
                println!(
                    "{}  {}  {}  date={}  available={}  next_check={}",
                    summary.id,
                    summary.name,
                    summary.url,
                    summary
                        .target_date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    summary.schedule_available,
                    summary
                        .next_check_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        Commands::History { target_id } => {
            for snapshot in engine.snapshot_summaries(target_id).await? {
                println!("{}  {}  {}", snapshot.checked_at.to_rfc3339(), snapshot.id, snapshot.summary);
            }
        }
    }

    Ok(())
}
