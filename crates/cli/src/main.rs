//! casefeed command-line entry point.
//!
//! Replays exported change feeds through a sync session into the SQLite
//! replica, and reports on what the replica holds. Results are printed to
//! stdout as JSON; logs go to stderr.

use anyhow::Result;
use casefeed_core::AppConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    tracing::info!(db_path = %config.db_path.display(), "casefeed starting");

    let json = match cli.command {
        Commands::Replay(args) => serde_json::to_string_pretty(&commands::replay::replay_impl(config, args).await?)?,
        Commands::Stats => serde_json::to_string_pretty(&commands::stats::stats_impl(&config).await?)?,
    };
    println!("{json}");

    Ok(())
}
