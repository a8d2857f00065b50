// ABOUTME: Durable audit store backed by an embedded SQLite file
// ABOUTME: Append-only fingerprint log, generation log, and per-run statistics

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::fingerprint::{Fingerprint, FINGERPRINT_SCHEME};
use crate::stats::{RunStats, TableReport};
use crate::tracker::PriorFingerprints;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit (
    entry_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id        INTEGER NOT NULL,
    table_name    TEXT NOT NULL,
    row_hash      TEXT NOT NULL,
    row_data      TEXT,
    modified      TEXT NOT NULL,
    kind          TEXT NOT NULL DEFAULT 'row'
);

CREATE INDEX IF NOT EXISTS audit_table_name ON audit(table_name);

CREATE TABLE IF NOT EXISTS row_count (
    run_id            INTEGER NOT NULL,
    table_name        TEXT NOT NULL,
    rows_processed    INTEGER NOT NULL,
    table_changes     INTEGER NOT NULL,
    database_changes  INTEGER NOT NULL,
    unconsumed        INTEGER NOT NULL,
    status            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS error (
    run_id      INTEGER NOT NULL,
    table_name  TEXT NOT NULL,
    count       INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS run (
    run_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at        TEXT NOT NULL,
    finished_at       TEXT,
    status            TEXT NOT NULL,
    first_run         INTEGER NOT NULL,
    rows_processed    INTEGER NOT NULL DEFAULT 0,
    database_changes  INTEGER NOT NULL DEFAULT 0,
    errors            INTEGER NOT NULL DEFAULT 0,
    elapsed_secs      REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS meta (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
"#;

const SCHEME_KEY: &str = "fingerprint_scheme";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Content recorded for a new or changed row
    Row,
    /// A previously recorded fingerprint no longer present in the source
    Removed,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Row => "row",
            EntryKind::Removed => "removed",
        }
    }

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "row" => Ok(EntryKind::Row),
            "removed" => Ok(EntryKind::Removed),
            other => Err(anyhow!("unknown audit entry kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }
}

/// Entry to append to the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub fingerprint: Fingerprint,
    pub row_dump: Option<String>,
    pub kind: EntryKind,
}

impl AuditEntry {
    pub fn row(fingerprint: Fingerprint, row_dump: Option<String>) -> Self {
        Self {
            fingerprint,
            row_dump,
            kind: EntryKind::Row,
        }
    }

    pub fn removed(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            row_dump: None,
            kind: EntryKind::Removed,
        }
    }
}

/// Entry as read back from the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub entry_id: i64,
    pub run_id: i64,
    pub table_name: String,
    pub fingerprint: Fingerprint,
    pub row_dump: Option<String>,
    pub modified: String,
    pub kind: EntryKind,
}

/// One audit run (generation) as recorded in the `run` table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub first_run: bool,
    pub rows_processed: i64,
    pub database_changes: i64,
    pub errors: i64,
}

/// The generation a run writes under: its id and the timestamp stamped on
/// every entry it appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub run_id: i64,
    pub timestamp: String,
}

pub struct AuditStore {
    path: PathBuf,
    conn: Connection,
    first_run: bool,
}

impl AuditStore {
    /// Open the store at `path`, creating the schema if it is missing.
    ///
    /// The run is a first run when the schema had to be created or the audit
    /// log holds no entries. Opening a store whose fingerprints were written
    /// under a different scheme is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create audit directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open audit database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"wal")
            .context("failed to enable WAL for audit database")?;

        let had_schema = table_exists(&conn, "audit")?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize audit schema")?;
        check_fingerprint_scheme(&conn)?;

        let first_run = if had_schema {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM audit", [], |row| row.get(0))
                .context("failed to count audit entries")?;
            count == 0
        } else {
            true
        };

        tracing::debug!(
            "Opened audit store {} (first run: {})",
            path.display(),
            first_run
        );

        Ok(Self {
            path: path.to_path_buf(),
            conn,
            first_run,
        })
    }

    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a new generation stamped with `timestamp`
    pub fn begin_run(&mut self, timestamp: &str) -> Result<Generation> {
        self.conn
            .execute(
                "INSERT INTO run(started_at, status, first_run) VALUES (?1, ?2, ?3)",
                params![timestamp, RunStatus::Running.as_str(), self.first_run],
            )
            .context("failed to record run start")?;
        Ok(Generation {
            run_id: self.conn.last_insert_rowid(),
            timestamp: timestamp.to_string(),
        })
    }

    /// All fingerprints currently on record for `table`.
    ///
    /// Entries are replayed in append order: a `row` entry adds an occurrence,
    /// a `removed` tombstone takes one away.
    pub fn load_prior_fingerprints(&self, table: &str) -> Result<PriorFingerprints> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT row_hash, kind FROM audit WHERE table_name = ?1 ORDER BY entry_id ASC",
            )
            .context("failed to prepare fingerprint query")?;
        let mut rows = stmt
            .query([table])
            .with_context(|| format!("failed to load fingerprints for table '{}'", table))?;

        let mut prior = PriorFingerprints::new();
        while let Some(row) = rows.next()? {
            let fingerprint = Fingerprint::from_stored(row.get(0)?);
            let kind: String = row.get(1)?;
            match EntryKind::from_str(&kind)? {
                EntryKind::Row => prior.insert(fingerprint),
                EntryKind::Removed => {
                    prior.consume(&fingerprint);
                }
            }
        }
        Ok(prior)
    }

    /// Append entries for one table in a single transaction.
    ///
    /// Either every entry is written or none is: any failed insert rolls the
    /// transaction back and the error is returned. An empty batch is a no-op.
    pub fn append_batch(
        &mut self,
        table: &str,
        entries: &[AuditEntry],
        generation: &Generation,
    ) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to begin audit transaction")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO audit(run_id, table_name, row_hash, row_data, modified, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    generation.run_id,
                    table,
                    entry.fingerprint.as_str(),
                    entry.row_dump,
                    generation.timestamp,
                    entry.kind.as_str(),
                ])
                .with_context(|| {
                    format!(
                        "failed to append audit entry {} for table '{}'",
                        entry.fingerprint, table
                    )
                })?;
            }
        }
        tx.commit()
            .with_context(|| format!("failed to commit audit batch for table '{}'", table))?;

        tracing::debug!("Committed {} audit entries for '{}'", entries.len(), table);
        Ok(entries.len())
    }

    /// Persist the per-table counters (and error count, if any) for a run
    pub fn record_table_report(
        &mut self,
        generation: &Generation,
        report: &TableReport,
        database_changes: u64,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to begin statistics transaction")?;
        tx.execute(
            "INSERT INTO row_count(run_id, table_name, rows_processed, table_changes,
                                   database_changes, unconsumed, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                generation.run_id,
                report.table,
                report.rows_processed as i64,
                report.changes as i64,
                database_changes as i64,
                report.unconsumed as i64,
                report.status.as_str(),
            ],
        )
        .with_context(|| format!("failed to record row counts for '{}'", report.table))?;

        let errors = report.error_count();
        if errors > 0 {
            tx.execute(
                "INSERT INTO error(run_id, table_name, count) VALUES (?1, ?2, ?3)",
                params![generation.run_id, report.table, errors as i64],
            )
            .with_context(|| format!("failed to record error count for '{}'", report.table))?;
        }
        tx.commit()
            .with_context(|| format!("failed to commit statistics for '{}'", report.table))?;
        Ok(())
    }

    /// Close out a generation with its final status and totals.
    ///
    /// Once a generation has left entries behind, later generations on this
    /// handle are no longer first runs.
    pub fn finish_run(
        &mut self,
        generation: &Generation,
        finished_at: &str,
        status: RunStatus,
        stats: &RunStats,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE run SET finished_at = ?2, status = ?3, rows_processed = ?4,
                                database_changes = ?5, errors = ?6, elapsed_secs = ?7
                 WHERE run_id = ?1",
                params![
                    generation.run_id,
                    finished_at,
                    status.as_str(),
                    stats.rows_processed as i64,
                    stats.database_changes as i64,
                    stats.total_errors() as i64,
                    stats.elapsed.as_secs_f64(),
                ],
            )
            .context("failed to record run completion")?;
        if updated != 1 {
            bail!("run {} not found in audit store", generation.run_id);
        }
        if self.first_run && self.entry_count()? > 0 {
            self.first_run = false;
        }
        Ok(())
    }

    pub fn entries_for_table(&self, table: &str) -> Result<Vec<StoredEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, run_id, table_name, row_hash, row_data, modified, kind
             FROM audit WHERE table_name = ?1 ORDER BY entry_id ASC",
        )?;
        let mut rows = stmt.query([table])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(6)?;
            out.push(StoredEntry {
                entry_id: row.get(0)?,
                run_id: row.get(1)?,
                table_name: row.get(2)?,
                fingerprint: Fingerprint::from_stored(row.get(3)?),
                row_dump: row.get(4)?,
                modified: row.get(5)?,
                kind: EntryKind::from_str(&kind)?,
            });
        }
        Ok(out)
    }

    pub fn entry_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM audit", [], |row| row.get(0))
            .context("failed to count audit entries")?;
        Ok(count as u64)
    }

    pub fn latest_run(&self) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                "SELECT run_id, started_at, finished_at, status, first_run,
                        rows_processed, database_changes, errors
                 FROM run ORDER BY run_id DESC LIMIT 1",
                [],
                |row| {
                    Ok(RunRecord {
                        run_id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        status: row.get(3)?,
                        first_run: row.get(4)?,
                        rows_processed: row.get(5)?,
                        database_changes: row.get(6)?,
                        errors: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Error count recorded for a table in a given run, if any
    pub fn error_count(&self, run_id: i64, table: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT count FROM error WHERE run_id = ?1 AND table_name = ?2",
                params![run_id, table],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()
        .context("failed to inspect audit schema")?;
    Ok(found.is_some())
}

fn check_fingerprint_scheme(conn: &Connection) -> Result<()> {
    let recorded: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            [SCHEME_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read fingerprint scheme")?;

    match recorded {
        Some(scheme) if scheme == FINGERPRINT_SCHEME => Ok(()),
        Some(scheme) => bail!(
            "audit store uses fingerprint scheme '{}' but this build writes '{}'; \
             use a fresh audit database",
            scheme,
            FINGERPRINT_SCHEME
        ),
        None => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES (?1, ?2)",
                params![SCHEME_KEY, FINGERPRINT_SCHEME],
            )
            .context("failed to record fingerprint scheme")?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TableStatus;
    use tempfile::tempdir;

    fn generation(store: &mut AuditStore) -> Generation {
        store.begin_run("2024-01-01 10:00:00").unwrap()
    }

    #[test]
    fn test_new_store_is_first_run() {
        let dir = tempdir().unwrap();
        let store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        assert!(store.is_first_run());
        assert_eq!(store.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_creates_missing_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.db");
        let store = AuditStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());
    }

    #[test]
    fn test_schema_without_entries_is_still_first_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.db");
        drop(AuditStore::open(&path).unwrap());

        let store = AuditStore::open(&path).unwrap();
        assert!(store.is_first_run());
    }

    #[test]
    fn test_reopen_with_entries_is_not_first_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let mut store = AuditStore::open(&path).unwrap();
            let gen = generation(&mut store);
            store
                .append_batch(
                    "customers",
                    &[AuditEntry::row(Fingerprint::of_dump("a"), None)],
                    &gen,
                )
                .unwrap();
        }
        let store = AuditStore::open(&path).unwrap();
        assert!(!store.is_first_run());
    }

    #[test]
    fn test_load_prior_fingerprints_per_table() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let gen = generation(&mut store);

        let a = Fingerprint::of_dump("a");
        let b = Fingerprint::of_dump("b");
        store
            .append_batch(
                "customers",
                &[
                    AuditEntry::row(a.clone(), Some("a".to_string())),
                    AuditEntry::row(b.clone(), Some("b".to_string())),
                ],
                &gen,
            )
            .unwrap();
        store
            .append_batch("invoices", &[AuditEntry::row(a.clone(), None)], &gen)
            .unwrap();

        let prior = store.load_prior_fingerprints("customers").unwrap();
        assert_eq!(prior.len(), 2);
        assert!(prior.contains(&a));
        assert!(prior.contains(&b));

        assert_eq!(store.load_prior_fingerprints("invoices").unwrap().len(), 1);
        assert!(store.load_prior_fingerprints("missing").unwrap().is_empty());
    }

    #[test]
    fn test_removed_tombstone_retires_fingerprint() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let gen = generation(&mut store);
        let a = Fingerprint::of_dump("a");

        store
            .append_batch("t", &[AuditEntry::row(a.clone(), None)], &gen)
            .unwrap();
        store
            .append_batch("t", &[AuditEntry::removed(a.clone())], &gen)
            .unwrap();
        assert!(store.load_prior_fingerprints("t").unwrap().is_empty());

        // Re-inserted later: on record again
        store
            .append_batch("t", &[AuditEntry::row(a.clone(), None)], &gen)
            .unwrap();
        assert!(store.load_prior_fingerprints("t").unwrap().contains(&a));

        let kinds: Vec<EntryKind> = store
            .entries_for_table("t")
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EntryKind::Row, EntryKind::Removed, EntryKind::Row]);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let gen = generation(&mut store);
        assert_eq!(store.append_batch("t", &[], &gen).unwrap(), 0);
        assert_eq!(store.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_failed_batch_leaves_no_partial_entries() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let gen = generation(&mut store);

        let poison = Fingerprint::of_dump("poison");
        store
            .connection()
            .execute_batch(&format!(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON audit
                 WHEN NEW.row_hash = '{}'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                poison
            ))
            .unwrap();

        let entries = vec![
            AuditEntry::row(Fingerprint::of_dump("1"), Some("1".to_string())),
            AuditEntry::row(Fingerprint::of_dump("2"), Some("2".to_string())),
            AuditEntry::row(poison, Some("poison".to_string())),
            AuditEntry::row(Fingerprint::of_dump("4"), Some("4".to_string())),
        ];
        let err = store.append_batch("t", &entries, &gen).unwrap_err();
        assert!(format!("{:#}", err).contains("rejected"));
        assert_eq!(store.entry_count().unwrap(), 0);

        // The store stays usable after the rollback
        store
            .append_batch("t", &entries[..2], &gen)
            .unwrap();
        assert_eq!(store.entry_count().unwrap(), 2);
    }

    #[test]
    fn test_entries_carry_generation() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let gen = generation(&mut store);
        store
            .append_batch(
                "t",
                &[AuditEntry::row(Fingerprint::of_dump("x"), Some("x".to_string()))],
                &gen,
            )
            .unwrap();

        let entries = store.entries_for_table("t").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].run_id, gen.run_id);
        assert_eq!(entries[0].modified, "2024-01-01 10:00:00");
        assert_eq!(entries[0].row_dump.as_deref(), Some("x"));
        assert_eq!(entries[0].table_name, "t");
    }

    #[test]
    fn test_finished_run_with_entries_ends_first_run() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();

        let empty = generation(&mut store);
        store
            .finish_run(&empty, "2024-01-01 10:00:01", RunStatus::Completed, &RunStats::default())
            .unwrap();
        assert!(store.is_first_run());

        let gen = generation(&mut store);
        store
            .append_batch(
                "customers",
                &[AuditEntry::row(Fingerprint::of_dump("a"), None)],
                &gen,
            )
            .unwrap();
        assert!(store.is_first_run());
        store
            .finish_run(&gen, "2024-01-01 10:00:02", RunStatus::Completed, &RunStats::default())
            .unwrap();
        assert!(!store.is_first_run());

        generation(&mut store);
        assert!(!store.latest_run().unwrap().unwrap().first_run);
    }

    #[test]
    fn test_run_lifecycle_and_statistics() {
        let dir = tempdir().unwrap();
        let mut store = AuditStore::open(dir.path().join("audit.db")).unwrap();
        let gen = generation(&mut store);

        let running = store.latest_run().unwrap().unwrap();
        assert_eq!(running.status, "running");
        assert!(running.first_run);
        assert!(running.finished_at.is_none());

        let report = TableReport {
            table: "tracks".to_string(),
            rows_processed: 5,
            changes: 2,
            row_errors: 1,
            unconsumed: 0,
            status: TableStatus::Completed,
            failure: None,
        };
        store.record_table_report(&gen, &report, 2).unwrap();

        let mut stats = RunStats::default();
        stats.record_table(report);
        store
            .finish_run(&gen, "2024-01-01 10:00:05", RunStatus::Completed, &stats)
            .unwrap();

        let finished = store.latest_run().unwrap().unwrap();
        assert_eq!(finished.run_id, gen.run_id);
        assert_eq!(finished.status, "completed");
        assert_eq!(finished.rows_processed, 5);
        assert_eq!(finished.database_changes, 2);
        assert_eq!(finished.errors, 1);
        assert_eq!(store.error_count(gen.run_id, "tracks").unwrap(), Some(1));
        assert_eq!(store.error_count(gen.run_id, "albums").unwrap(), None);
    }

    #[test]
    fn test_foreign_fingerprint_scheme_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = AuditStore::open(&path).unwrap();
            store
                .connection()
                .execute(
                    "UPDATE meta SET value = 'md5/json-v0' WHERE key = ?1",
                    [SCHEME_KEY],
                )
                .unwrap();
        }
        let err = AuditStore::open(&path).err().unwrap();
        assert!(err.to_string().contains("md5/json-v0"));
    }
}
