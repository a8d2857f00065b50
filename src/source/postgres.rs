// ABOUTME: PostgreSQL source backend driven by a connection string
// ABOUTME: Streams rows from the server and maps column types onto raw values

use std::str::FromStr;

use anyhow::{Context, Result};
use futures::{pin_mut, StreamExt};
use tokio_postgres::types::{Kind, ToSql, Type};
use tokio_postgres::{Client, Row};

use super::{ColumnMeta, RawRow, RawValue, RowFetch, SourceBackend, TableDescriptor};
use crate::error::ScanError;
use crate::utils::quote_ident;

/// Networked source backend.
pub struct PostgresSource {
    client: Client,
}

impl PostgresSource {
    /// Connect using a libpq-style connection string or URL.
    ///
    /// TLS is negotiated per the connection string's `sslmode`;
    /// `allow_self_signed_certs` disables certificate verification.
    pub async fn connect(connection_string: &str, allow_self_signed_certs: bool) -> Result<Self> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(allow_self_signed_certs)
            .build()
            .context("Failed to build TLS connector")?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(connection_string, tls)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to {}",
                    crate::utils::redact_connection_string(connection_string)
                )
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl SourceBackend for PostgresSource {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn list_tables(&mut self) -> Result<Vec<TableDescriptor>> {
        tracing::debug!("Listing tables from PostgreSQL database");

        let rows = self
            .client
            .query(
                "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' \
                 AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY table_schema, table_name",
                &[],
            )
            .await
            .context("Failed to query table list")?;

        let tables: Vec<TableDescriptor> = rows
            .iter()
            .map(|row| TableDescriptor::qualified(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect();

        tracing::info!("Found {} user tables in PostgreSQL database", tables.len());

        Ok(tables)
    }

    async fn scan_table<F>(&mut self, table: &TableDescriptor, mut sink: F) -> Result<(), ScanError>
    where
        F: FnMut(RowFetch<'_>) -> Result<(), ScanError>,
    {
        let described = self
            .client
            .prepare(&format!("SELECT * FROM {}", table.quoted()))
            .await
            .with_context(|| format!("Failed to prepare statement for table '{}'", table))
            .map_err(ScanError::Source)?;

        let plan: Vec<(String, Type)> = described
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.type_().clone()))
            .collect();
        let columns: Vec<ColumnMeta> = plan
            .iter()
            .map(|(name, ty)| ColumnMeta::named(name.as_str(), Some(ty.name().to_string())))
            .collect();

        let statement = if plan.iter().all(|(_, ty)| read_as(ty) != ReadAs::Text) {
            described
        } else {
            let query = scan_query(table, &plan);
            tracing::debug!("Scanning '{}' with text casts: {}", table, query);
            self.client
                .prepare(&query)
                .await
                .with_context(|| format!("Failed to prepare statement for table '{}'", table))
                .map_err(ScanError::Source)?
        };

        let stream = self
            .client
            .query_raw(&statement, slice_iter(&[]))
            .await
            .with_context(|| format!("Failed to query rows from table '{}'", table))
            .map_err(ScanError::Source)?;
        pin_mut!(stream);

        let mut row_num = 0usize;
        while let Some(next) = stream.next().await {
            row_num += 1;
            let fetched = next
                .map_err(anyhow::Error::from)
                .and_then(|row| decode_row(&row, &plan))
                .with_context(|| format!("Failed to read row {} from table '{}'", row_num, table))
                .map(|values| RawRow {
                    columns: &columns,
                    values,
                });
            sink(fetched)?;
        }

        Ok(())
    }
}

/// How a column's values are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadAs {
    /// Binary protocol decoded by its `FromSql` impl
    Native,
    /// Cast to `text` in the scan query
    Text,
    /// Array, range or composite: no scalar form
    Unsupported,
}

fn read_as(ty: &Type) -> ReadAs {
    match *ty {
        Type::BOOL
        | Type::CHAR
        | Type::INT2
        | Type::INT4
        | Type::INT8
        | Type::OID
        | Type::FLOAT4
        | Type::FLOAT8
        | Type::TEXT
        | Type::VARCHAR
        | Type::BPCHAR
        | Type::NAME
        | Type::UNKNOWN
        | Type::BYTEA
        | Type::DATE
        | Type::TIME
        | Type::TIMESTAMP
        | Type::TIMESTAMPTZ
        | Type::JSON
        | Type::JSONB
        | Type::UUID => ReadAs::Native,
        _ => match ty.kind() {
            Kind::Array(_) | Kind::Range(_) | Kind::Composite(_) => ReadAs::Unsupported,
            _ => ReadAs::Text,
        },
    }
}

/// `SELECT` list for a table, casting every text-read column to `text`
/// under its own name so column order and naming are unchanged.
fn scan_query(table: &TableDescriptor, plan: &[(String, Type)]) -> String {
    let select_list: Vec<String> = plan
        .iter()
        .map(|(name, ty)| {
            let ident = quote_ident(name);
            match read_as(ty) {
                ReadAs::Text => format!("{0}::text AS {0}", ident),
                ReadAs::Native | ReadAs::Unsupported => ident,
            }
        })
        .collect();
    format!("SELECT {} FROM {}", select_list.join(", "), table.quoted())
}

fn slice_iter<'a>(
    s: &'a [&'a (dyn ToSql + Sync)],
) -> impl ExactSizeIterator<Item = &'a dyn ToSql> + 'a {
    s.iter().map(|s| *s as _)
}

fn decode_row(row: &Row, plan: &[(String, Type)]) -> Result<Vec<RawValue>> {
    plan.iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            decode_value(row, idx, ty).with_context(|| format!("column '{}' ({})", name, ty))
        })
        .collect()
}

fn get<'a, T>(row: &'a Row, idx: usize, wrap: impl FnOnce(T) -> RawValue) -> Result<RawValue>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    Ok(row
        .try_get::<_, Option<T>>(idx)?
        .map(wrap)
        .unwrap_or(RawValue::Null))
}

/// Map one column of a row to a raw value by its declared type.
fn decode_value(row: &Row, idx: usize, ty: &Type) -> Result<RawValue> {
    match read_as(ty) {
        ReadAs::Native => {}
        ReadAs::Text if *ty == Type::NUMERIC => return get::<String>(row, idx, parse_numeric),
        ReadAs::Text => return get::<String>(row, idx, RawValue::Text),
        ReadAs::Unsupported => {
            return Ok(RawValue::Unsupported {
                type_name: ty.name().to_string(),
            })
        }
    }

    match *ty {
        Type::BOOL => get::<bool>(row, idx, RawValue::Bool),
        Type::CHAR => get::<i8>(row, idx, |v| RawValue::Integer(i64::from(v))),
        Type::INT2 => get::<i16>(row, idx, |v| RawValue::Integer(i64::from(v))),
        Type::INT4 => get::<i32>(row, idx, |v| RawValue::Integer(i64::from(v))),
        Type::INT8 => get::<i64>(row, idx, RawValue::Integer),
        Type::OID => get::<u32>(row, idx, |v| RawValue::Integer(i64::from(v))),
        Type::FLOAT4 => get::<f32>(row, idx, |v| RawValue::Float(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx, RawValue::Float),
        Type::BYTEA => get::<Vec<u8>>(row, idx, RawValue::Bytes),
        Type::DATE => get::<chrono::NaiveDate>(row, idx, RawValue::Date),
        Type::TIME => get::<chrono::NaiveTime>(row, idx, RawValue::Time),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx, RawValue::DateTime),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx, |v| RawValue::DateTimeTz(v.into()))
        }
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx, RawValue::Json),
        Type::UUID => get::<uuid::Uuid>(row, idx, RawValue::Uuid),
        _ => get::<String>(row, idx, RawValue::Text),
    }
}

/// `numeric` arrives as text: exact decimal when it fits, otherwise the float
/// it spells (`NaN`, `Infinity`, or out of decimal range).
fn parse_numeric(text: String) -> RawValue {
    if let Ok(decimal) = rust_decimal::Decimal::from_str(&text) {
        return RawValue::Decimal(decimal);
    }
    match text.parse::<f64>() {
        Ok(f) => RawValue::Float(f),
        Err(_) => RawValue::Text(text),
    }
}
