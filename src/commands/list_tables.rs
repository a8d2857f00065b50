// ABOUTME: List-tables command - prints every table the detector would scan
// ABOUTME: Read-only against the target, never touches the audit store

use anyhow::Result;

use crate::config::Config;
use crate::source::{SourceBackend, TableDescriptor};
use crate::utils::sanitize_identifier;

use super::Target;

pub async fn list_tables(config: &Config) -> Result<()> {
    let tables = match Target::open(config).await? {
        Target::Sqlite(mut source) => source.list_tables().await?,
        Target::Postgres(mut source) => source.list_tables().await?,
    };
    tracing::debug!("Found {} tables", tables.len());

    print!("{}", format_listing(&tables));
    Ok(())
}

/// One table per line, in enumeration order
pub fn format_listing(tables: &[TableDescriptor]) -> String {
    tables
        .iter()
        .map(|t| format!("{}\n", sanitize_identifier(&t.audit_name())))
        .collect()
}
