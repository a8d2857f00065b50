// ABOUTME: CLI entry point for database-auditor
// ABOUTME: Parses flags, loads configuration and routes to list-tables or audit

use anyhow::Context;
use clap::{CommandFactory, Parser};
use database_auditor::commands;
use database_auditor::config::{Config, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "database-auditor")]
#[command(
    about = "Row-level change detection for SQLite and PostgreSQL databases",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Print the tables that would be audited
    #[arg(short = 'l', long = "list-tables", conflicts_with = "audit")]
    list_tables: bool,
    /// Fingerprint every row and record changes since the last run
    #[arg(short = 'a', long = "audit")]
    audit: bool,
    /// Path to the JSON configuration file
    #[arg(long, env = "DATABASE_AUDITOR_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if !cli.list_tables && !cli.audit {
        Cli::command()
            .print_help()
            .context("Failed to print usage")?;
        return Ok(());
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate()?;

    if cli.list_tables {
        commands::list_tables(&config).await
    } else {
        commands::audit(&config).await
    }
}
