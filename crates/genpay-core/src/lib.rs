//! Core types for genpay.
//!
//! genpay is the money-safety layer behind a chat bot that resells a
//! generative-media API. This crate holds the types every other crate shares:
//!
//! - **Identifiers**: `UserId`, `ChatId`, `TaskId`
//! - **Money**: decimal amount validation
//! - **Accounts**: `Account`
//! - **Reservations**: `Reservation`, `ReservationStatus`, `ChargeRecord`
//! - **Jobs**: `Job`, `JobStatus`
//! - **Free tier**: `FreeUsageRecord`, `LimitDecision`, `UsageWindows`
//! - **Referrals**: `ReferralInfo`
//!
//! # Amounts
//!
//! All money is `rust_decimal::Decimal`. Balances are never negative; a hold
//! followed by a release restores the balance to the exact same value.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod error;
pub mod ids;
pub mod job;
pub mod money;
pub mod referral;
pub mod reservation;
pub mod usage;

pub use account::Account;
pub use error::{Result, ValidationError};
pub use ids::{ChatId, IdError, TaskId, UserId};
pub use job::{
    normalize_result_urls, validate_result_url, Job, JobStatus, NewJob, DELIVERY_FAIL_MARKER,
};
pub use money::{amount_from_f64, ensure_non_negative, parse_amount};
pub use referral::{ReferralInfo, DEFAULT_REFERRAL_BONUS_GENERATIONS};
pub use reservation::{
    ChargeRecord, ChargeSource, HoldOutcome, Reservation, ReservationStatus, SettleOutcome,
};
pub use usage::{FreeUsageRecord, LimitDecision, LimitReason, UsageWindows};

pub use rust_decimal::Decimal;
