// ABOUTME: Run and per-table statistics for an audit run
// ABOUTME: Aggregates change, row and error counts for reporting and persistence

use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Completed,
    /// Scan stopped by a source or encoding failure; nothing further was committed
    Aborted,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Completed => "completed",
            TableStatus::Aborted => "aborted",
        }
    }
}

/// Outcome of scanning one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub rows_processed: u64,
    pub changes: u64,
    pub row_errors: u64,
    /// Prior fingerprints not matched by any scanned row
    pub unconsumed: u64,
    pub status: TableStatus,
    pub failure: Option<String>,
}

impl TableReport {
    /// Row errors plus one if the scan itself was aborted
    pub fn error_count(&self) -> u64 {
        self.row_errors + u64::from(self.status == TableStatus::Aborted)
    }
}

/// Statistics for a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub rows_processed: u64,
    pub database_changes: u64,
    pub tables: Vec<TableReport>,
    pub elapsed: Duration,
}

impl RunStats {
    pub fn record_table(&mut self, report: TableReport) {
        self.rows_processed += report.rows_processed;
        self.database_changes += report.changes;
        self.tables.push(report);
    }

    pub fn total_errors(&self) -> u64 {
        self.tables.iter().map(TableReport::error_count).sum()
    }

    /// Error counts keyed by table, tables without errors omitted
    pub fn errors_by_table(&self) -> BTreeMap<String, u64> {
        self.tables
            .iter()
            .filter(|t| t.error_count() > 0)
            .map(|t| (t.table.clone(), t.error_count()))
            .collect()
    }

    pub fn tables_failed(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.status == TableStatus::Aborted)
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn total_unconsumed(&self) -> u64 {
        self.tables.iter().map(|t| t.unconsumed).sum()
    }

    /// True when every table scan completed
    pub fn is_success(&self) -> bool {
        self.tables.iter().all(|t| t.status == TableStatus::Completed)
    }
}
