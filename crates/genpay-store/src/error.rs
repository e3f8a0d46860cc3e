//! Error types for genpay storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A read or write did not finish in time.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// What was being attempted.
        operation: &'static str,
        /// The configured limit.
        seconds: u64,
    },

    /// Stored data failed validation.
    #[error("store corruption: {0}")]
    Corruption(String),
}
