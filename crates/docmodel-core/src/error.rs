//! Error types for DocModel operations.

use std::fmt;

/// The primary error type for all DocModel operations.
#[derive(Debug)]
pub enum Error {
    /// Errors reported by the backing document store
    Store(StoreError),
    /// A tracked entity's server copy changed underneath it
    Concurrency(ConcurrencyError),
    /// Cancellation requested for a cascading delete outside a transaction
    UnsupportedCancellation(String),
    /// `count` requested for a type with an active post-materialization filter
    UnsupportedPostFilterCount {
        /// Entity type the count was issued for
        entity_type: &'static str,
    },
    /// Bulk delete requested without a predicate or id set
    MissingFilter {
        /// Entity type the delete was issued for
        entity_type: &'static str,
    },
    /// Transaction errors
    Transaction(TransactionError),
    /// Invalid argument passed to an operation
    Argument(String),
    /// Configuration errors (unregistered entity types, invalid settings)
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
    /// Document id the failure refers to, when the store reports one.
    pub id: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Retryable write contention (another writer touched the same documents)
    TransientWriteConflict,
    /// Unique index violation, including an upsert whose filter missed an existing `_id`
    DuplicateKey,
    /// Connection lost or unreachable server
    Network,
    /// Server-side timeout
    Timeout,
    /// Any other store failure
    Other,
}

/// Optimistic concurrency conflict details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyError {
    /// Name of the conflicting entity's family root
    pub entity_type: &'static str,
    /// Id of the conflicting document
    pub id: String,
    /// Top-level fields whose server value differs from the last known snapshot
    pub fields: Vec<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Topology does not support multi-document transactions
    NotSupported,
    /// A transaction is already open on the session
    AlreadyActive,
    /// No transaction is open on the session
    NotActive,
    /// The server aborted the transaction
    Aborted,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this the store's retryable write-conflict signal?
    ///
    /// This is the only error kind the save pipeline retries.
    pub fn is_transient_write_conflict(&self) -> bool {
        matches!(
            self,
            Error::Store(StoreError {
                kind: StoreErrorKind::TransientWriteConflict,
                ..
            })
        )
    }

    /// Is this an optimistic concurrency conflict?
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::Concurrency(_))
    }

    /// Is this a duplicate key violation reported by the store?
    pub fn is_duplicate_key(&self) -> bool {
        matches!(
            self,
            Error::Store(StoreError {
                kind: StoreErrorKind::DuplicateKey,
                ..
            })
        )
    }

    /// Is this a "must specify a filter" rejection?
    pub fn is_missing_filter(&self) -> bool {
        matches!(self, Error::MissingFilter { .. })
    }

    /// Build a store error of the given kind.
    pub fn store(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Error::Store(StoreError {
            kind,
            message: message.into(),
            id: None,
            source: None,
        })
    }

    /// Build a transaction error of the given kind.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Store(e) => write!(f, "Store error: {}", e),
            Error::Concurrency(e) => write!(f, "Concurrency conflict: {}", e),
            Error::UnsupportedCancellation(msg) => {
                write!(f, "Cancellation not supported: {}", msg)
            }
            Error::UnsupportedPostFilterCount { entity_type } => write!(
                f,
                "Count is not supported for {} while a post-filter is active",
                entity_type
            ),
            Error::MissingFilter { entity_type } => {
                write!(f, "Delete of {} must specify a filter", entity_type)
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Argument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{:?}: {} (id {})", self.kind, self.message, id),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} was modified by another writer (fields: {})",
            self.entity_type,
            self.id,
            self.fields.join(", ")
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => e
                .source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<ConcurrencyError> for Error {
    fn from(err: ConcurrencyError) -> Self {
        Error::Concurrency(err)
    }
}

/// Result type alias for DocModel operations.
pub type Result<T> = std::result::Result<T, Error>;
