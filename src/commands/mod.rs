// ABOUTME: Command implementations for the CLI modes
// ABOUTME: Exports list-tables and audit commands

pub mod audit;
pub mod list_tables;

pub use audit::audit;
pub use list_tables::list_tables;

use anyhow::{Context, Result};

use crate::config::{Config, SourceKind};
use crate::source::{PostgresSource, SqliteSource};

/// The configured target, opened as whichever backend the config selects
pub enum Target {
    Sqlite(SqliteSource),
    Postgres(PostgresSource),
}

impl Target {
    pub async fn open(config: &Config) -> Result<Self> {
        let target = &config.target;
        tracing::info!(
            "Opening {} target {}",
            target.kind.as_str(),
            crate::utils::redact_connection_string(&target.connection_string)
        );
        match target.kind {
            SourceKind::Sqlite => {
                let source = SqliteSource::open(&target.connection_string).with_context(|| {
                    format!("Failed to open target database '{}'", target.connection_string)
                })?;
                Ok(Target::Sqlite(source))
            }
            SourceKind::Postgres => {
                let source =
                    PostgresSource::connect(&target.connection_string, target.allow_self_signed_certs)
                        .await
                        .context("Failed to connect to target PostgreSQL database")?;
                Ok(Target::Postgres(source))
            }
        }
    }
}
