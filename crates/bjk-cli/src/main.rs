//! bjk entry point.
//!
//! Thin shell: tracing + env setup and argument parsing live here, command
//! logic lives in `commands`.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

const DEFAULT_EVENTS_DIR: &str = "contracts/golden_events/v1";

#[derive(Parser)]
#[command(name = "bjk")]
#[command(about = "Blackjack event-bus operator tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate envelope JSON files against the v1 contract catalog.
    Validate {
        /// Files to validate. When empty, every .json under --events-dir.
        paths: Vec<String>,

        /// Directory scanned when no paths are given.
        #[arg(long, default_value = DEFAULT_EVENTS_DIR)]
        events_dir: String,
    },

    /// Print the valid golden events as JSON lines (a dry-run publish).
    Golden {
        #[arg(long, default_value = DEFAULT_EVENTS_DIR)]
        events_dir: String,
    },

    /// End-to-end smoke over an in-process broker: publish the golden
    /// corpus, drain every stream with a worker, report counts.
    Smoke {
        #[arg(long, default_value = DEFAULT_EVENTS_DIR)]
        events_dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent when absent.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Validate { paths, events_dir } => commands::validate(&paths, &events_dir),
        Commands::Golden { events_dir } => commands::golden(&events_dir),
        Commands::Smoke { events_dir } => commands::smoke(&events_dir).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
