use thiserror::Error;

/// Library error type.
///
/// Deduplication conflicts are deliberately absent: they are reported as a
/// benign [`EnqueueOutcome::Deduplicated`](crate::store::EnqueueOutcome)
/// rather than an error.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Invalid configuration; fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A declared extra field has no matching column on the table.
    #[error("extra field '{field}' has no column on table '{table}'")]
    UnknownExtraField { field: String, table: String },

    /// `start_processing` was called while a processor is active.
    #[error("queue '{0}' is already processing")]
    AlreadyRunning(String),

    /// A body or result value failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-agnostic storage failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    #[cfg(feature = "mysql")]
    /// Transient or fatal database failure surfaced by the driver.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
