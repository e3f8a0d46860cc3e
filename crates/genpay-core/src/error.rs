//! Error types for genpay core.

use rust_decimal::Decimal;

use crate::ids::IdError;

/// Result type for validation in genpay core.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Input rejected before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Amount is below zero.
    #[error("amount must not be negative: {amount}")]
    NegativeAmount {
        /// The offending amount.
        amount: Decimal,
    },

    /// Amount is NaN or infinite.
    #[error("amount is not a finite number")]
    NonFiniteAmount,

    /// Amount cannot be represented as a decimal.
    #[error("amount out of range: {0}")]
    AmountOutOfRange(String),

    /// Applying the delta would leave a negative balance.
    #[error("balance would become negative: balance={balance}, delta={delta}")]
    BalanceWouldGoNegative {
        /// Current balance.
        balance: Decimal,
        /// Requested change.
        delta: Decimal,
    },

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Result URL is empty or not http(s).
    #[error("invalid result url: {url:?}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },
}
