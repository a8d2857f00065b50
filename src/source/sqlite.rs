// ABOUTME: Embedded SQLite source backend - table listing and row-at-a-time scans
// ABOUTME: Decodes each row independently so one unreadable row does not stop the table

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use super::{ColumnMeta, RawRow, RawValue, RowFetch, SourceBackend, TableDescriptor};
use crate::error::ScanError;

/// Open a SQLite database read-only.
///
/// The file must already exist; an audit never creates its source.
///
/// # Examples
///
/// ```no_run
/// # use database_auditor::source::sqlite::open_sqlite;
/// # fn example() -> anyhow::Result<()> {
/// let conn = open_sqlite("Chinook_Sqlite.sqlite")?;
/// # Ok(())
/// # }
/// ```
pub fn open_sqlite(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if !path.is_file() {
        bail!("SQLite database not found: {}", path.display());
    }
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open SQLite database {}", path.display()))
}

/// List all user tables in a SQLite database
///
/// Queries sqlite_master for objects of type `table`, excluding the
/// `sqlite_*` internal tables. Views, indexes and triggers are skipped.
///
/// # Returns
///
/// Sorted vector of table names
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    tracing::debug!("Listing tables from SQLite database");

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type='table' \
             AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .context("Failed to prepare statement to list tables")?;

    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .context("Failed to query table list")?
        .collect::<Result<Vec<String>, _>>()
        .context("Failed to collect table names")?;

    tracing::info!("Found {} user tables in SQLite database", tables.len());

    Ok(tables)
}

/// Embedded-engine source backend.
pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: open_sqlite(path)?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl SourceBackend for SqliteSource {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn list_tables(&mut self) -> Result<Vec<TableDescriptor>> {
        Ok(list_tables(&self.conn)?
            .into_iter()
            .map(TableDescriptor::new)
            .collect())
    }

    async fn scan_table<F>(&mut self, table: &TableDescriptor, sink: F) -> Result<(), ScanError>
    where
        F: FnMut(RowFetch<'_>) -> Result<(), ScanError>,
    {
        scan_table(&self.conn, table, sink)
    }
}

/// Execute `SELECT *` on `table` and feed each row to `sink`.
///
/// A row whose values cannot be decoded is delivered as a row error and the
/// scan moves on. Failures to prepare or step the cursor end the scan.
pub fn scan_table<F>(conn: &Connection, table: &TableDescriptor, mut sink: F) -> Result<(), ScanError>
where
    F: FnMut(RowFetch<'_>) -> Result<(), ScanError>,
{
    let query = format!("SELECT * FROM {}", table.quoted());
    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("Failed to prepare statement for table '{}'", table))
        .map_err(ScanError::Source)?;

    let columns: Vec<ColumnMeta> = stmt
        .columns()
        .iter()
        .map(|c| ColumnMeta::named(c.name(), c.decl_type().map(str::to_string)))
        .collect();

    tracing::debug!(
        "Table '{}' has {} columns: {:?}",
        table,
        columns.len(),
        columns.iter().map(|c| c.key.to_string()).collect::<Vec<_>>()
    );

    let mut rows = stmt
        .query([])
        .with_context(|| format!("Failed to query rows from table '{}'", table))
        .map_err(ScanError::Source)?;

    let mut row_num = 0usize;
    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => {
                return Err(ScanError::Source(anyhow::Error::new(e).context(format!(
                    "Failed to fetch row {} from table '{}'",
                    row_num + 1,
                    table
                ))))
            }
        };
        row_num += 1;

        let fetched = decode_row(row, columns.len())
            .with_context(|| format!("Failed to read row {} from table '{}'", row_num, table))
            .map(|values| RawRow {
                columns: &columns,
                values,
            });
        sink(fetched)?;
    }

    Ok(())
}

fn decode_row(row: &rusqlite::Row<'_>, width: usize) -> Result<Vec<RawValue>> {
    (0..width)
        .map(|idx| {
            let value = row.get_ref(idx)?;
            decode_value(value).with_context(|| format!("column {}", idx))
        })
        .collect()
}

fn decode_value(value: ValueRef<'_>) -> Result<RawValue> {
    Ok(match value {
        ValueRef::Null => RawValue::Null,
        ValueRef::Integer(i) => RawValue::Integer(i),
        ValueRef::Real(f) => RawValue::Float(f),
        ValueRef::Text(bytes) => RawValue::Text(
            std::str::from_utf8(bytes)
                .context("text value is not valid UTF-8")?
                .to_string(),
        ),
        ValueRef::Blob(bytes) => RawValue::Bytes(bytes.to_vec()),
    })
}
