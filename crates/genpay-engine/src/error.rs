//! Engine error types.

use genpay_client::ClientError;
use genpay_core::{IdError, TaskId, ValidationError};
use genpay_store::StoreError;

use crate::settlement::SettlementAction;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// Insufficient funds and lost settlement races are outcomes, not errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Input rejected before any state was touched.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Durable store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Remote task API failure.
    #[error("remote API error: {0}")]
    Client(#[from] ClientError),

    /// A commit or release could not be made durable after retrying.
    #[error("{action} of task {task_id} failed after {attempts} attempts")]
    SettlementFailed {
        /// The task whose reservation is still pending.
        task_id: TaskId,
        /// What was attempted.
        action: SettlementAction,
        /// Attempts made.
        attempts: u32,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<IdError> for EngineError {
    fn from(err: IdError) -> Self {
        Self::Validation(err.into())
    }
}

impl EngineError {
    /// Whether retrying the same call may help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(_) => true,
            Self::Client(e) => e.is_retryable(),
            _ => false,
        }
    }
}
