// ABOUTME: Audit command - runs one full change-detection pass
// ABOUTME: Prints per-table change counts and the run summary

use anyhow::{Context, Result};

use crate::auditor::{AuditOptions, Auditor};
use crate::config::Config;
use crate::source::SourceBackend;
use crate::stats::{RunStats, TableReport};
use crate::store::AuditStore;
use crate::utils::sanitize_identifier;

use super::Target;

pub async fn audit(config: &Config) -> Result<()> {
    let target = Target::open(config).await?;

    let audit_path = config.audit_path();
    let mut store = AuditStore::open(&audit_path)
        .with_context(|| format!("Failed to open audit store '{}'", audit_path.display()))?;
    if store.is_first_run() {
        tracing::info!(
            "Audit store '{}' is new, every row will be recorded as a change",
            audit_path.display()
        );
    }

    let options = AuditOptions::from(&config.audit);
    let stats = match target {
        Target::Sqlite(mut source) => run(&mut store, options, &mut source).await?,
        Target::Postgres(mut source) => run(&mut store, options, &mut source).await?,
    };

    print!("{}", format_summary(&stats));
    Ok(())
}

async fn run<S: SourceBackend>(
    store: &mut AuditStore,
    options: AuditOptions,
    source: &mut S,
) -> Result<RunStats> {
    Auditor::new(store, options)
        .on_table_complete(|report| print!("{}", format_table_line(report)))
        .run(source)
        .await
}

pub fn format_table_line(report: &TableReport) -> String {
    format!("===> {} {}\n", sanitize_identifier(&report.table), report.changes)
}

/// End-of-run summary: totals, then any per-table error counts
pub fn format_summary(stats: &RunStats) -> String {
    let mut out = String::new();
    out.push_str(&format!("Database changes ---> {}\n", stats.database_changes));
    out.push_str(&format!("Rows processed ---> {}\n", stats.rows_processed));
    out.push_str(&format!("Errors ---> {}\n", stats.total_errors()));
    for (table, count) in stats.errors_by_table() {
        out.push_str(&format!("  {} ---> {}\n", sanitize_identifier(&table), count));
    }
    let failed = stats.tables_failed();
    if !failed.is_empty() {
        let names: Vec<String> = failed.iter().map(|t| sanitize_identifier(t)).collect();
        out.push_str(&format!("Tables failed ---> {}\n", names.join(", ")));
    }
    out.push_str(&format!(
        "Execution time ---> {:.2}s\n",
        stats.elapsed.as_secs_f64()
    ));
    out
}
