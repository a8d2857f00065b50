// ABOUTME: Row normalization - backend raw rows to canonical ordered key/value rows
// ABOUTME: Neutralizes type differences so equal content hashes identically on any backend

use chrono::SecondsFormat;
use rust_decimal::prelude::ToPrimitive;

use crate::source::{ColumnKey, RawRow, RawValue};

/// Scalar value of a canonical row.
///
/// `Unsigned` holds the decimal digits of a byte string read as a big-endian
/// unsigned integer too wide for `i64`.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(String),
    Float(f64),
    Text(String),
    Unsupported { type_name: String },
}

/// Ordered mapping of column key to canonical value.
///
/// Order is the column order of the scan query and is never sorted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanonicalRow {
    entries: Vec<(ColumnKey, CanonicalValue)>,
}

impl CanonicalRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: ColumnKey, value: CanonicalValue) {
        self.entries.push((key, value));
    }

    pub fn get(&self, name: &str) -> Option<&CanonicalValue> {
        self.entries
            .iter()
            .find(|(key, _)| matches!(key, ColumnKey::Name(n) if n == name))
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ColumnKey, CanonicalValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ColumnKey, CanonicalValue)> for CanonicalRow {
    fn from_iter<I: IntoIterator<Item = (ColumnKey, CanonicalValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Convert a fetched row into its canonical form.
///
/// Textual column names are lower-cased; ordinal keys pass through. Values are
/// coerced with [`normalize_value`]. Columns beyond the shorter of the
/// metadata and value lists are ignored.
///
/// # Examples
///
/// ```
/// # use database_auditor::normalize::{normalize_row, CanonicalValue};
/// # use database_auditor::source::{ColumnMeta, RawRow, RawValue};
/// let columns = vec![ColumnMeta::named("CustomerId", None)];
/// let row = RawRow { columns: &columns, values: vec![RawValue::Integer(7)] };
/// let canonical = normalize_row(row);
/// assert_eq!(canonical.get("customerid"), Some(&CanonicalValue::Integer(7)));
/// ```
pub fn normalize_row(row: RawRow<'_>) -> CanonicalRow {
    row.columns
        .iter()
        .zip(row.values)
        .map(|(column, value)| (normalize_key(&column.key), normalize_value(value)))
        .collect()
}

fn normalize_key(key: &ColumnKey) -> ColumnKey {
    match key {
        ColumnKey::Name(name) => ColumnKey::Name(name.to_lowercase()),
        ColumnKey::Ordinal(idx) => ColumnKey::Ordinal(*idx),
    }
}

/// Coerce a single raw value.
///
/// - exact decimal → float
/// - date / time / timestamp → ISO-8601 text
/// - bytes → unsigned big-endian integer
/// - text → text with NUL characters removed
/// - json → compact JSON text, uuid → hyphenated text
/// - unsupported types pass through and fail later at encoding
pub fn normalize_value(value: RawValue) -> CanonicalValue {
    match value {
        RawValue::Null => CanonicalValue::Null,
        RawValue::Bool(b) => CanonicalValue::Bool(b),
        RawValue::Integer(i) => CanonicalValue::Integer(i),
        RawValue::Float(f) => CanonicalValue::Float(f),
        RawValue::Decimal(d) => match d.to_f64() {
            Some(f) => CanonicalValue::Float(f),
            // Unreachable for finite decimals; keep the exact text rather than drop it
            None => CanonicalValue::Text(d.normalize().to_string()),
        },
        RawValue::Text(s) => CanonicalValue::Text(strip_nul(s)),
        RawValue::Bytes(b) => bytes_to_unsigned(&b),
        RawValue::Date(d) => CanonicalValue::Text(d.format("%Y-%m-%d").to_string()),
        RawValue::Time(t) => CanonicalValue::Text(t.format("%H:%M:%S%.f").to_string()),
        RawValue::DateTime(dt) => {
            CanonicalValue::Text(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        RawValue::DateTimeTz(dt) => {
            CanonicalValue::Text(dt.to_rfc3339_opts(SecondsFormat::AutoSi, false))
        }
        RawValue::Json(json) => CanonicalValue::Text(strip_nul(json.to_string())),
        RawValue::Uuid(u) => CanonicalValue::Text(u.hyphenated().to_string()),
        RawValue::Unsupported { type_name } => CanonicalValue::Unsupported { type_name },
    }
}

fn strip_nul(s: String) -> String {
    if s.contains('\0') {
        s.replace('\0', "")
    } else {
        s
    }
}

/// Interpret bytes as an unsigned big-endian integer.
fn bytes_to_unsigned(bytes: &[u8]) -> CanonicalValue {
    let significant = match bytes.iter().position(|b| *b != 0) {
        Some(start) => &bytes[start..],
        None => return CanonicalValue::Integer(0),
    };

    if significant.len() <= 8 {
        let value = significant
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        if let Ok(value) = i64::try_from(value) {
            return CanonicalValue::Integer(value);
        }
    }

    CanonicalValue::Unsigned(decimal_digits(significant))
}

/// Base-256 to base-10 conversion for arbitrarily long byte strings.
fn decimal_digits(bytes: &[u8]) -> String {
    // little-endian decimal digits
    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = u32::from(byte);
        for digit in digits.iter_mut() {
            let v = u32::from(*digit) * 256 + carry;
            *digit = (v % 10) as u8;
            carry = v / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }
    digits.iter().rev().map(|d| char::from(b'0' + d)).collect()
}
