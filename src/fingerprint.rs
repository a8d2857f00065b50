// ABOUTME: Row fingerprinting - deterministic row dump plus SHA-256 content hash
// ABOUTME: The row dump is the exact text stored in the audit log

use std::fmt;
use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::error::EncodeError;
use crate::normalize::{CanonicalRow, CanonicalValue};
use crate::source::ColumnKey;

/// Identifies the dump format and digest. Stored in the audit store so that
/// fingerprints written by a different scheme are never compared.
pub const FINGERPRINT_SCHEME: &str = "sha256/json-v1";

/// Hex-encoded SHA-256 of a row dump (64 lower-case characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_dump(dump: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(dump.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap a fingerprint read back from the audit store
    pub fn from_stored(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A row dump together with its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFingerprint {
    pub fingerprint: Fingerprint,
    pub dump: String,
}

/// Serialize and hash a canonical row.
pub fn fingerprint_row(row: &CanonicalRow) -> Result<RowFingerprint, EncodeError> {
    let dump = encode_row(row)?;
    Ok(RowFingerprint {
        fingerprint: Fingerprint::of_dump(&dump),
        dump,
    })
}

/// Encode a canonical row as a JSON object, members in row order.
///
/// Output looks like `{"id": 1, "name": "Alice"}`. Strings use JSON escaping,
/// floats use the shortest round-trip form (non-finite floats as `Infinity`,
/// `-Infinity` and `NaN`), wide unsigned integers are written
/// as plain digits. Unsupported values are rejected.
pub fn encode_row(row: &CanonicalRow) -> Result<String, EncodeError> {
    let mut out = String::with_capacity(16 * row.len() + 2);
    out.push('{');
    for (idx, (key, value)) in row.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        push_json_string(&mut out, &key_text(key));
        out.push_str(": ");
        push_value(&mut out, key, value)?;
    }
    out.push('}');
    Ok(out)
}

fn key_text(key: &ColumnKey) -> String {
    match key {
        ColumnKey::Name(name) => name.clone(),
        ColumnKey::Ordinal(idx) => idx.to_string(),
    }
}

fn push_value(out: &mut String, key: &ColumnKey, value: &CanonicalValue) -> Result<(), EncodeError> {
    match value {
        CanonicalValue::Null => out.push_str("null"),
        CanonicalValue::Bool(true) => out.push_str("true"),
        CanonicalValue::Bool(false) => out.push_str("false"),
        CanonicalValue::Integer(i) => {
            let _ = write!(out, "{}", i);
        }
        CanonicalValue::Unsigned(digits) => out.push_str(digits),
        CanonicalValue::Float(f) => match serde_json::Number::from_f64(*f) {
            Some(number) => {
                let _ = write!(out, "{}", number);
            }
            None => out.push_str(non_finite_token(*f)),
        },
        CanonicalValue::Text(s) => push_json_string(out, s),
        CanonicalValue::Unsupported { type_name } => {
            return Err(EncodeError::UnsupportedType {
                column: key_text(key),
                type_name: type_name.clone(),
            })
        }
    }
    Ok(())
}

/// Bare tokens for values plain JSON cannot hold
fn non_finite_token(f: f64) -> &'static str {
    if f.is_nan() {
        "NaN"
    } else if f.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn push_json_string(out: &mut String, s: &str) {
    // Serializing a str to JSON cannot fail
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => unreachable!("string serialization is infallible"),
    }
}
