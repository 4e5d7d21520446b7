//! Error types for the notification core.

/// Errors surfaced by the notification pipeline and connection registry.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// A required record field was missing or empty. Raised before any
    /// side effect happens.
    #[error("invalid notification: {0}")]
    Validation(String),

    /// The durable sink rejected the record or was unreachable.
    #[error("notification persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// The connection registry is full.
    #[error("connection registry at capacity ({capacity} connections)")]
    ResourceExhausted {
        /// The configured maximum number of live connections.
        capacity: usize,
    },

    /// A record could not be serialized for the wire.
    #[error("notification serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the persistence sink.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No pooled connection could be checked out.
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A SQL statement failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("column serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored timestamp was not valid RFC 3339.
    #[error("invalid stored timestamp {value:?}: {source}")]
    Timestamp {
        /// The raw column value.
        value: String,
        /// The parse failure.
        source: chrono::ParseError,
    },

    /// The blocking persistence task panicked or was cancelled.
    #[error("persistence task failed: {0}")]
    Task(String),
}

/// Why a single send to a connection failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The connection's writer has gone away.
    #[error("connection closed")]
    Closed,

    /// The connection did not accept the message in time.
    #[error("send timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// The aggregate broadcast deadline passed before this send finished.
    #[error("broadcast deadline exceeded")]
    DeadlineExceeded,
}
