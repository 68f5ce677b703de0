//! Session and transaction options passed to the backing store.

use std::time::Duration;

/// Which replica a read is routed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    Nearest,
}

/// Isolation level requested for reads inside a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadConcern {
    #[default]
    Local,
    Majority,
    Snapshot,
}

/// Durability level requested for writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteConcern {
    Unacknowledged,
    #[default]
    Acknowledged,
    Majority,
}

/// Options applied to every transaction started on a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub read_preference: ReadPreference,
    pub read_concern: ReadConcern,
    pub write_concern: WriteConcern,
    /// Upper bound on the server-side commit duration.
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn read_preference(mut self, value: ReadPreference) -> Self {
        self.read_preference = value;
        self
    }

    #[must_use]
    pub fn read_concern(mut self, value: ReadConcern) -> Self {
        self.read_concern = value;
        self
    }

    #[must_use]
    pub fn write_concern(mut self, value: WriteConcern) -> Self {
        self.write_concern = value;
        self
    }

    #[must_use]
    pub fn max_commit_time(mut self, value: Duration) -> Self {
        self.max_commit_time = Some(value);
        self
    }
}

/// Options used when a unit of work starts its server session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub causal_consistency: bool,
    pub default_transaction: TransactionOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            causal_consistency: true,
            default_transaction: TransactionOptions::default(),
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn causal_consistency(mut self, value: bool) -> Self {
        self.causal_consistency = value;
        self
    }

    #[must_use]
    pub fn default_transaction(mut self, value: TransactionOptions) -> Self {
        self.default_transaction = value;
        self
    }
}
