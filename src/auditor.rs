// ABOUTME: Run orchestration - drives normalize, fingerprint and classify for every table
// ABOUTME: Commits batches to the audit store and aggregates per-run statistics

use std::time::Instant;

use anyhow::{Context, Result};

use crate::config::{AuditConfig, DeletionPolicy, FirstRunPayloads};
use crate::error::ScanError;
use crate::fingerprint::fingerprint_row;
use crate::normalize::normalize_row;
use crate::source::{SourceBackend, TableDescriptor};
use crate::stats::{RunStats, TableReport, TableStatus};
use crate::store::{AuditEntry, AuditStore, Generation, RunStatus};
use crate::tracker::{ChangeSetTracker, PendingEntry};

/// Knobs for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditOptions {
    /// Pending entries per intermediate commit
    pub batch_size: usize,
    pub deletion_policy: DeletionPolicy,
    pub first_run_payloads: FirstRunPayloads,
}

impl Default for AuditOptions {
    fn default() -> Self {
        AuditOptions::from(&AuditConfig::default())
    }
}

impl From<&AuditConfig> for AuditOptions {
    fn from(config: &AuditConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            deletion_policy: config.deletion_policy,
            first_run_payloads: config.first_run_payloads,
        }
    }
}

/// Drives one full audit run against a source.
///
/// Tables are scanned one at a time. Each table gets its own
/// [`ChangeSetTracker`], which is consumed when the table finishes, so no
/// state crosses table boundaries.
pub struct Auditor<'a> {
    store: &'a mut AuditStore,
    options: AuditOptions,
    on_table: Option<Box<dyn FnMut(&TableReport) + 'a>>,
}

impl<'a> Auditor<'a> {
    pub fn new(store: &'a mut AuditStore, options: AuditOptions) -> Self {
        Self {
            store,
            options,
            on_table: None,
        }
    }

    /// Callback invoked as each table finishes
    pub fn on_table_complete(mut self, callback: impl FnMut(&TableReport) + 'a) -> Self {
        self.on_table = Some(Box::new(callback));
        self
    }

    /// Run a full detection pass over every table the source lists.
    ///
    /// Row-level problems are counted and tables that cannot be scanned are
    /// reported as aborted; the run only fails when the source cannot list its
    /// tables or the audit store cannot persist a batch. A failed run is
    /// recorded as `failed` in the store before the error is returned.
    pub async fn run<S: SourceBackend>(&mut self, source: &mut S) -> Result<RunStats> {
        let started = Instant::now();
        let generation = self.store.begin_run(&timestamp_now())?;

        tracing::info!(
            "Starting audit run {} against {} source (first run: {})",
            generation.run_id,
            source.kind(),
            self.store.is_first_run()
        );

        let mut stats = RunStats::default();
        let outcome = self.audit_tables(source, &generation, &mut stats).await;
        stats.elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                let status = if stats.is_success() {
                    RunStatus::Completed
                } else {
                    RunStatus::CompletedWithErrors
                };
                self.store
                    .finish_run(&generation, &timestamp_now(), status, &stats)?;
                tracing::info!(
                    "Audit run {} {}: {} changes across {} rows in {:.2}s",
                    generation.run_id,
                    status.as_str(),
                    stats.database_changes,
                    stats.rows_processed,
                    stats.elapsed.as_secs_f64()
                );
                Ok(stats)
            }
            Err(e) => {
                if let Err(mark_err) =
                    self.store
                        .finish_run(&generation, &timestamp_now(), RunStatus::Failed, &stats)
                {
                    tracing::warn!("Failed to mark run {} as failed: {:#}", generation.run_id, mark_err);
                }
                Err(e)
            }
        }
    }

    async fn audit_tables<S: SourceBackend>(
        &mut self,
        source: &mut S,
        generation: &Generation,
        stats: &mut RunStats,
    ) -> Result<()> {
        let tables = source
            .list_tables()
            .await
            .context("Failed to enumerate source tables")?;

        for table in &tables {
            let report = self.audit_table(source, table, generation).await?;
            stats.record_table(report.clone());
            self.store
                .record_table_report(generation, &report, stats.database_changes)?;
            if let Some(callback) = self.on_table.as_mut() {
                callback(&report);
            }
        }
        Ok(())
    }

    /// Scan one table and commit what changed.
    ///
    /// Returns `Err` only for audit store failures.
    pub async fn audit_table<S: SourceBackend>(
        &mut self,
        source: &mut S,
        table: &TableDescriptor,
        generation: &Generation,
    ) -> Result<TableReport> {
        let name = table.audit_name();
        let prior = self.store.load_prior_fingerprints(&name)?;
        tracing::debug!("Loaded {} prior fingerprints for '{}'", prior.len(), name);

        let omit_payloads = self.store.is_first_run()
            && self.options.first_run_payloads == FirstRunPayloads::Omit;
        let mut tracker = ChangeSetTracker::new(name.clone(), prior, self.options.batch_size);
        let store = &mut *self.store;
        // entries already flushed by intermediate batches
        let mut committed = 0u64;

        let scanned = source
            .scan_table(table, |fetched| {
                match fetched {
                    Ok(raw) => {
                        let row = fingerprint_row(&normalize_row(raw))?;
                        tracker.observe(row);
                        if let Some(batch) = tracker.take_full_batch() {
                            let entries = into_entries(batch, omit_payloads);
                            committed += store
                                .append_batch(&name, &entries, generation)
                                .map_err(ScanError::Store)? as u64;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Error reading from table '{}': {:#}", name, e);
                        tracker.record_row_error();
                    }
                }
                Ok(())
            })
            .await;

        match scanned {
            Ok(()) => self.finish_table(tracker, omit_payloads, generation),
            Err(ScanError::Store(e)) => {
                Err(e.context(format!("Failed to persist changes for table '{}'", name)))
            }
            Err(e) => {
                let scan = tracker.finish();
                tracing::warn!(
                    "Aborting scan of table '{}': {:#} ({} pending changes discarded)",
                    name,
                    e,
                    scan.changes - committed
                );
                Ok(TableReport {
                    table: name,
                    rows_processed: scan.rows_processed,
                    changes: committed,
                    row_errors: scan.row_errors,
                    unconsumed: 0,
                    status: TableStatus::Aborted,
                    failure: Some(format!("{:#}", anyhow::Error::from(e))),
                })
            }
        }
    }

    fn finish_table(
        &mut self,
        tracker: ChangeSetTracker,
        omit_payloads: bool,
        generation: &Generation,
    ) -> Result<TableReport> {
        let scan = tracker.finish();
        let unconsumed = scan.unconsumed.len() as u64;
        let mut entries = into_entries(scan.pending, omit_payloads);

        match self.options.deletion_policy {
            DeletionPolicy::Ignore => {
                tracing::debug!(
                    "{} prior fingerprints unmatched in '{}'",
                    unconsumed,
                    scan.table
                );
            }
            DeletionPolicy::Report => {
                if unconsumed > 0 {
                    tracing::info!(
                        "{} rows removed or replaced in '{}' since the last run",
                        unconsumed,
                        scan.table
                    );
                    for fingerprint in &scan.unconsumed {
                        tracing::debug!("Unmatched fingerprint {} in '{}'", fingerprint, scan.table);
                    }
                }
            }
            // An unreadable row leaves its fingerprint unmatched without being gone
            DeletionPolicy::Record if scan.row_errors > 0 => {
                if unconsumed > 0 {
                    tracing::warn!(
                        "Not recording {} removals in '{}': {} rows could not be read",
                        unconsumed,
                        scan.table,
                        scan.row_errors
                    );
                }
            }
            DeletionPolicy::Record => {
                entries.extend(scan.unconsumed.into_iter().map(AuditEntry::removed));
            }
        }

        self.store
            .append_batch(&scan.table, &entries, generation)
            .with_context(|| format!("Failed to persist changes for table '{}'", scan.table))?;

        Ok(TableReport {
            table: scan.table,
            rows_processed: scan.rows_processed,
            changes: scan.changes,
            row_errors: scan.row_errors,
            unconsumed,
            status: TableStatus::Completed,
            failure: None,
        })
    }
}

fn into_entries(batch: Vec<PendingEntry>, omit_payloads: bool) -> Vec<AuditEntry> {
    batch
        .into_iter()
        .map(|entry| {
            let dump = if omit_payloads {
                None
            } else {
                Some(entry.row_dump)
            };
            AuditEntry::row(entry.fingerprint, dump)
        })
        .collect()
}

fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::source::{ColumnMeta, RawRow, RawValue, RowFetch};
    use crate::store::EntryKind;
    use tempfile::tempdir;

    /// Scripted in-memory source. `None` in a table's rows is a row that
    /// fails to fetch.
    struct ScriptedSource {
        columns: Vec<ColumnMeta>,
        tables: Vec<(String, Vec<Option<Vec<RawValue>>>)>,
        fail_table: Option<String>,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                columns: vec![
                    ColumnMeta::named("Id", Some("INTEGER".to_string())),
                    ColumnMeta::named("Name", Some("TEXT".to_string())),
                ],
                tables: Vec::new(),
                fail_table: None,
            }
        }

        fn table(mut self, name: &str, rows: Vec<Option<(i64, &str)>>) -> Self {
            let rows = rows
                .into_iter()
                .map(|r| r.map(|(id, n)| vec![RawValue::Integer(id), RawValue::Text(n.to_string())]))
                .collect();
            self.tables.push((name.to_string(), rows));
            self
        }
    }

    impl SourceBackend for ScriptedSource {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn list_tables(&mut self) -> Result<Vec<TableDescriptor>> {
            Ok(self
                .tables
                .iter()
                .map(|(name, _)| TableDescriptor::new(name.clone()))
                .collect())
        }

        async fn scan_table<F>(&mut self, table: &TableDescriptor, mut sink: F) -> Result<(), ScanError>
        where
            F: FnMut(RowFetch<'_>) -> Result<(), ScanError>,
        {
            if self.fail_table.as_deref() == Some(table.name.as_str()) {
                return Err(ScanError::Source(anyhow::anyhow!("no such table")));
            }
            let rows = self
                .tables
                .iter()
                .find(|(name, _)| *name == table.name)
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default();
            for row in rows {
                match row {
                    Some(values) => sink(Ok(RawRow {
                        columns: &self.columns,
                        values,
                    }))?,
                    None => sink(Err(anyhow::anyhow!("unreadable row")))?,
                }
            }
            Ok(())
        }
    }

    fn options(batch_size: usize, deletion_policy: DeletionPolicy) -> AuditOptions {
        AuditOptions {
            batch_size,
            deletion_policy,
            first_run_payloads: FirstRunPayloads::Store,
        }
    }

    async fn run_once(store: &mut AuditStore, source: &mut ScriptedSource, opts: AuditOptions) -> RunStats {
        Auditor::new(store, opts).run(source).await.unwrap()
    }

    #[tokio::test]
    async fn test_row_error_isolation() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut source = ScriptedSource::new().table(
            "people",
            vec![
                Some((1, "a")),
                Some((2, "b")),
                None,
                Some((4, "d")),
                Some((5, "e")),
            ],
        );

        let stats = run_once(&mut store, &mut source, AuditOptions::default()).await;
        let people = stats.table("people").unwrap();
        assert_eq!(people.rows_processed, 4);
        assert_eq!(people.changes, 4);
        assert_eq!(people.row_errors, 1);
        assert_eq!(people.status, TableStatus::Completed);
        assert_eq!(stats.total_errors(), 1);
        assert!(stats.is_success());

        let run = store.latest_run().unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(store.error_count(run.run_id, "people").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut source = ScriptedSource::new()
            .table("people", vec![Some((1, "a")), Some((2, "b")), Some((2, "b"))]);

        let first = run_once(&mut store, &mut source, AuditOptions::default()).await;
        assert_eq!(first.database_changes, 3);

        let second = run_once(&mut store, &mut source, AuditOptions::default()).await;
        assert_eq!(second.database_changes, 0);
        assert_eq!(second.rows_processed, 3);
        assert_eq!(store.entry_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_intermediate_batches_commit_everything() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let rows = (1..=7).map(|i| Some((i, "x"))).collect();
        let mut source = ScriptedSource::new().table("bulk", rows);

        let stats = run_once(&mut store, &mut source, options(3, DeletionPolicy::Ignore)).await;
        assert_eq!(stats.database_changes, 7);
        assert_eq!(store.entries_for_table("bulk").unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_aborted_table_does_not_stop_run() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut source = ScriptedSource::new()
            .table("broken", vec![Some((1, "a"))])
            .table("fine", vec![Some((1, "a"))]);
        source.fail_table = Some("broken".to_string());

        let stats = run_once(&mut store, &mut source, AuditOptions::default()).await;
        assert_eq!(stats.tables_failed(), vec!["broken"]);
        assert_eq!(stats.table("fine").unwrap().changes, 1);
        assert!(stats
            .table("broken")
            .unwrap()
            .failure
            .as_deref()
            .unwrap()
            .contains("no such table"));
        assert_eq!(store.latest_run().unwrap().unwrap().status, "completed_with_errors");
    }

    #[tokio::test]
    async fn test_unencodable_value_aborts_table_without_commit() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut source = ScriptedSource::new();
        source.tables.push((
            "shapes".to_string(),
            vec![
                Some(vec![RawValue::Integer(1), RawValue::Text("ok".to_string())]),
                Some(vec![
                    RawValue::Integer(2),
                    RawValue::Unsupported {
                        type_name: "polygon".to_string(),
                    },
                ]),
            ],
        ));

        let stats = run_once(&mut store, &mut source, AuditOptions::default()).await;
        let shapes = stats.table("shapes").unwrap();
        assert_eq!(shapes.status, TableStatus::Aborted);
        assert!(shapes.failure.as_deref().unwrap().contains("polygon"));
        assert!(store.entries_for_table("shapes").unwrap().is_empty());
        assert_eq!(shapes.changes, 0);
        assert_eq!(stats.database_changes, 0);
        assert_eq!(store.latest_run().unwrap().unwrap().database_changes, 0);
    }

    #[tokio::test]
    async fn test_aborted_table_reports_only_committed_changes() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut source = ScriptedSource::new();
        source.tables.push((
            "shapes".to_string(),
            vec![
                Some(vec![RawValue::Integer(1), RawValue::Text("a".to_string())]),
                Some(vec![RawValue::Integer(2), RawValue::Text("b".to_string())]),
                Some(vec![RawValue::Integer(3), RawValue::Text("c".to_string())]),
                Some(vec![
                    RawValue::Integer(4),
                    RawValue::Unsupported {
                        type_name: "polygon".to_string(),
                    },
                ]),
            ],
        ));

        let stats = run_once(&mut store, &mut source, options(2, DeletionPolicy::Ignore)).await;
        let shapes = stats.table("shapes").unwrap();
        assert_eq!(shapes.status, TableStatus::Aborted);
        assert_eq!(shapes.rows_processed, 3);
        assert_eq!(shapes.changes, 2);
        assert_eq!(store.entries_for_table("shapes").unwrap().len(), 2);
        assert_eq!(store.latest_run().unwrap().unwrap().database_changes, 2);
    }

    #[tokio::test]
    async fn test_non_finite_floats_are_audited() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut source = ScriptedSource::new();
        source.tables.push((
            "readings".to_string(),
            vec![
                Some(vec![RawValue::Integer(1), RawValue::Float(f64::INFINITY)]),
                Some(vec![RawValue::Integer(2), RawValue::Float(f64::NAN)]),
            ],
        ));

        let stats = run_once(&mut store, &mut source, AuditOptions::default()).await;
        let readings = stats.table("readings").unwrap();
        assert_eq!(readings.status, TableStatus::Completed);
        assert_eq!(readings.changes, 2);

        let again = run_once(&mut store, &mut source, AuditOptions::default()).await;
        assert_eq!(again.database_changes, 0);
    }

    #[tokio::test]
    async fn test_record_policy_skips_tombstones_after_row_errors() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let opts = options(100, DeletionPolicy::Record);
        let rows = vec![Some((1, "a")), Some((2, "b")), Some((3, "c"))];

        let mut source = ScriptedSource::new().table("people", rows.clone());
        run_once(&mut store, &mut source, opts.clone()).await;

        let mut flaky = ScriptedSource::new()
            .table("people", vec![Some((1, "a")), Some((2, "b")), None]);
        let stats = run_once(&mut store, &mut flaky, opts.clone()).await;
        let people = stats.table("people").unwrap();
        assert_eq!(people.row_errors, 1);
        assert_eq!(people.unconsumed, 1);
        assert!(store
            .entries_for_table("people")
            .unwrap()
            .iter()
            .all(|e| e.kind == EntryKind::Row));

        let mut source = ScriptedSource::new().table("people", rows);
        let stats = run_once(&mut store, &mut source, opts).await;
        assert_eq!(stats.database_changes, 0);
        assert_eq!(stats.total_unconsumed(), 0);
    }

    #[tokio::test]
    async fn test_record_policy_writes_tombstones() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let opts = options(100, DeletionPolicy::Record);

        let mut source = ScriptedSource::new().table("people", vec![Some((1, "a")), Some((2, "b"))]);
        run_once(&mut store, &mut source, opts.clone()).await;

        let mut source = ScriptedSource::new().table("people", vec![Some((1, "a"))]);
        let stats = run_once(&mut store, &mut source, opts.clone()).await;
        assert_eq!(stats.table("people").unwrap().unconsumed, 1);

        let entries = store.entries_for_table("people").unwrap();
        let removed: Vec<_> = entries.iter().filter(|e| e.kind == EntryKind::Removed).collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(
            removed[0].fingerprint,
            Fingerprint::of_dump(r#"{"id": 2, "name": "b"}"#)
        );

        // Row 2 comes back: it is new again because its fingerprint was retired
        let mut source = ScriptedSource::new().table("people", vec![Some((1, "a")), Some((2, "b"))]);
        let stats = run_once(&mut store, &mut source, opts).await;
        assert_eq!(stats.database_changes, 1);
        assert_eq!(stats.total_unconsumed(), 0);
    }

    #[tokio::test]
    async fn test_first_run_payloads_can_be_omitted() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let opts = AuditOptions {
            first_run_payloads: FirstRunPayloads::Omit,
            ..AuditOptions::default()
        };
        let mut source = ScriptedSource::new().table("people", vec![Some((1, "a"))]);
        run_once(&mut store, &mut source, opts).await;

        let entries = store.entries_for_table("people").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].row_dump.is_none());
    }

    #[tokio::test]
    async fn test_later_runs_on_same_store_keep_payloads() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let opts = AuditOptions {
            first_run_payloads: FirstRunPayloads::Omit,
            ..AuditOptions::default()
        };
        let mut source = ScriptedSource::new().table("people", vec![Some((1, "a"))]);
        run_once(&mut store, &mut source, opts.clone()).await;

        let mut source =
            ScriptedSource::new().table("people", vec![Some((1, "a")), Some((2, "b"))]);
        run_once(&mut store, &mut source, opts).await;

        let entries = store.entries_for_table("people").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].row_dump.is_none());
        assert_eq!(entries[1].row_dump.as_deref(), Some(r#"{"id": 2, "name": "b"}"#));
    }

    #[tokio::test]
    async fn test_on_table_callback_sees_each_table() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let mut source = ScriptedSource::new()
            .table("a", vec![Some((1, "x"))])
            .table("b", vec![]);

        let mut seen = Vec::new();
        Auditor::new(&mut store, AuditOptions::default())
            .on_table_complete(|report| seen.push((report.table.clone(), report.changes)))
            .run(&mut source)
            .await
            .unwrap();
        assert_eq!(seen, vec![("a".to_string(), 1), ("b".to_string(), 0)]);
    }
}
