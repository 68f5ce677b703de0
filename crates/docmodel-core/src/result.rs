//! Write result types.

use std::ops::AddAssign;

/// Counts reported by the store for one bulk write request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
    /// Pure inserts.
    pub inserted: u64,
    /// Replace operations that found no match and inserted instead.
    pub upserted: u64,
}

/// Aggregate of every bulk write issued by one save.
///
/// `inserted_count` includes upserts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergedWriteResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub inserted_count: u64,
}

impl MergedWriteResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one family's result into the aggregate.
    pub fn merge(&mut self, result: &BulkWriteResult) {
        self.matched_count += result.matched;
        self.modified_count += result.modified;
        self.deleted_count += result.deleted;
        self.inserted_count += result.inserted + result.upserted;
    }

    /// Total documents touched.
    pub fn total(&self) -> u64 {
        self.matched_count + self.deleted_count + self.inserted_count
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign<&BulkWriteResult> for MergedWriteResult {
    fn add_assign(&mut self, rhs: &BulkWriteResult) {
        self.merge(rhs);
    }
}
