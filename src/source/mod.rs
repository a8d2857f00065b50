// ABOUTME: Source backend seam - table enumeration and row-at-a-time scanning
// ABOUTME: Defines the backend-neutral raw row shape consumed by the normalizer

pub mod postgres;
pub mod sqlite;

use std::fmt;

use crate::error::ScanError;

pub use postgres::PostgresSource;
pub use sqlite::SqliteSource;

/// A table enumerated from the source catalog.
///
/// The scan query is always `SELECT * FROM <table>`, so the descriptor carries
/// nothing beyond the (optionally schema-qualified) name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableDescriptor {
    pub schema: Option<String>,
    pub name: String,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Name used as the audit log key (`schema.table` when qualified)
    pub fn audit_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    /// Quoted identifier suitable for the scan query
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!(
                "{}.{}",
                crate::utils::quote_ident(schema),
                crate::utils::quote_ident(&self.name)
            ),
            None => crate::utils::quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.audit_name())
    }
}

/// Identifier of a result column as the driver reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnKey {
    Name(String),
    Ordinal(usize),
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKey::Name(name) => f.write_str(name),
            ColumnKey::Ordinal(idx) => write!(f, "{}", idx),
        }
    }
}

/// Column metadata: key plus the backend's declared type, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub key: ColumnKey,
    pub type_hint: Option<String>,
}

impl ColumnMeta {
    pub fn named(name: impl Into<String>, type_hint: Option<String>) -> Self {
        Self {
            key: ColumnKey::Name(name.into()),
            type_hint,
        }
    }
}

/// A scalar as fetched from either backend, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Decimal(rust_decimal::Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    DateTime(chrono::NaiveDateTime),
    DateTimeTz(chrono::DateTime<chrono::FixedOffset>),
    Json(serde_json::Value),
    Uuid(uuid::Uuid),
    /// A value of a type the backend has no mapping for
    Unsupported { type_name: String },
}

/// One fetched row: values positionally aligned with `columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow<'a> {
    pub columns: &'a [ColumnMeta],
    pub values: Vec<RawValue>,
}

/// Result of fetching a single row. An `Err` is a per-row failure; the scan
/// keeps going after handing it to the sink.
pub type RowFetch<'a> = Result<RawRow<'a>, anyhow::Error>;

/// A source database the auditor can enumerate and scan.
///
/// Rows are delivered to `sink` one at a time in query order. Returning an
/// error from the sink stops the scan and the error is passed back to the
/// caller unchanged.
#[allow(async_fn_in_trait)]
pub trait SourceBackend {
    /// Backend kind label for logs
    fn kind(&self) -> &'static str;

    async fn list_tables(&mut self) -> anyhow::Result<Vec<TableDescriptor>>;

    async fn scan_table<F>(&mut self, table: &TableDescriptor, sink: F) -> Result<(), ScanError>
    where
        F: FnMut(RowFetch<'_>) -> Result<(), ScanError>;
}
