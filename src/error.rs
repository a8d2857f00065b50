// ABOUTME: Typed errors for the scan pipeline
// ABOUTME: Separates table-fatal failures from audit store failures that abort a run

use thiserror::Error;

/// A canonical row value with no defined row-dump encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("column '{column}' has unsupported type '{type_name}'")]
    UnsupportedType { column: String, type_name: String },
}

/// Why a table scan stopped early.
///
/// `Source` and `Encode` end the current table only; `Store` means the audit
/// store could not persist a batch and the whole run has to stop.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Source(anyhow::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Store(anyhow::Error),
}

impl ScanError {
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, ScanError::Store(_))
    }
}
