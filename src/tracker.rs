// ABOUTME: Change set tracking - classifies scanned rows against the prior fingerprint set
// ABOUTME: Unconsumed prior fingerprints at table end signal removed or replaced rows

use std::collections::HashMap;

use crate::fingerprint::{Fingerprint, RowFingerprint};

/// Fingerprints on record for one table, counted per occurrence.
///
/// Each recorded occurrence can be matched by exactly one scanned row, so two
/// identical rows need two recorded entries to both count as unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorFingerprints {
    counts: HashMap<Fingerprint, usize>,
    total: usize,
}

impl PriorFingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fingerprint: Fingerprint) {
        *self.counts.entry(fingerprint).or_insert(0) += 1;
        self.total += 1;
    }

    /// Remove one occurrence; returns false if none was on record
    pub fn consume(&mut self, fingerprint: &Fingerprint) -> bool {
        match self.counts.get_mut(fingerprint) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(fingerprint);
                }
                self.total -= 1;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.counts.contains_key(fingerprint)
    }

    /// Number of occurrences still on record
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Remaining occurrences, sorted for stable output
    pub fn into_remaining(self) -> Vec<Fingerprint> {
        let mut remaining: Vec<Fingerprint> = self
            .counts
            .into_iter()
            .flat_map(|(fp, count)| std::iter::repeat(fp).take(count))
            .collect();
        remaining.sort();
        remaining
    }
}

impl FromIterator<Fingerprint> for PriorFingerprints {
    fn from_iter<I: IntoIterator<Item = Fingerprint>>(iter: I) -> Self {
        let mut prior = PriorFingerprints::new();
        for fp in iter {
            prior.insert(fp);
        }
        prior
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowClass {
    /// Matched a prior fingerprint
    Unchanged,
    /// New row or changed content
    Changed,
}

/// A new/changed row waiting to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub fingerprint: Fingerprint,
    pub row_dump: String,
}

/// Per-table scan state: the unconsumed prior set, the pending batch and the
/// table counters. Owned by one table scan and consumed by [`finish`].
///
/// [`finish`]: ChangeSetTracker::finish
#[derive(Debug)]
pub struct ChangeSetTracker {
    table: String,
    prior: PriorFingerprints,
    pending: Vec<PendingEntry>,
    batch_size: usize,
    rows_processed: u64,
    changes: u64,
    row_errors: u64,
}

/// What a finished table scan leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableScan {
    pub table: String,
    pub pending: Vec<PendingEntry>,
    pub unconsumed: Vec<Fingerprint>,
    pub rows_processed: u64,
    pub changes: u64,
    pub row_errors: u64,
}

impl ChangeSetTracker {
    /// Start tracking a table.
    ///
    /// `batch_size` is the number of pending entries that triggers an
    /// intermediate flush; it is clamped to at least 1.
    pub fn new(table: impl Into<String>, prior: PriorFingerprints, batch_size: usize) -> Self {
        Self {
            table: table.into(),
            prior,
            pending: Vec::new(),
            batch_size: batch_size.max(1),
            rows_processed: 0,
            changes: 0,
            row_errors: 0,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Classify one fingerprinted row.
    ///
    /// A match consumes one prior occurrence. Anything else is queued as a
    /// new/changed entry and counted.
    pub fn observe(&mut self, row: RowFingerprint) -> RowClass {
        self.rows_processed += 1;
        if self.prior.consume(&row.fingerprint) {
            return RowClass::Unchanged;
        }

        self.changes += 1;
        self.pending.push(PendingEntry {
            fingerprint: row.fingerprint,
            row_dump: row.dump,
        });
        RowClass::Changed
    }

    pub fn record_row_error(&mut self) {
        self.row_errors += 1;
    }

    /// Hand out the pending batch once it reaches the batch size
    pub fn take_full_batch(&mut self) -> Option<Vec<PendingEntry>> {
        if self.pending.len() >= self.batch_size {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    pub fn changes(&self) -> u64 {
        self.changes
    }

    pub fn rows_processed(&self) -> u64 {
        self.rows_processed
    }

    pub fn row_errors(&self) -> u64 {
        self.row_errors
    }

    pub fn finish(self) -> TableScan {
        TableScan {
            table: self.table,
            pending: self.pending,
            unconsumed: self.prior.into_remaining(),
            rows_processed: self.rows_processed,
            changes: self.changes,
            row_errors: self.row_errors,
        }
    }
}
