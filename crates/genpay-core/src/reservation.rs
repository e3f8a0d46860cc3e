//! Reservation (hold) types.
//!
//! A reservation earmarks funds for one paid action. It starts `Pending` and
//! moves to exactly one terminal status; the terminal status is never
//! overwritten.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{TaskId, UserId};

/// Status of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Funds are earmarked and subtracted from the visible balance.
    Pending,
    /// Funds are permanently spent.
    Committed,
    /// Funds were returned to the balance.
    Released,
}

impl ReservationStatus {
    /// Whether no further transition is allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Released)
    }

    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }
}

/// A hold on a user's funds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Task this hold pays for.
    pub task_id: TaskId,

    /// Owner of the funds.
    pub user_id: UserId,

    /// Earmarked amount.
    pub amount: Decimal,

    /// Current status.
    pub status: ReservationStatus,

    /// Model the hold was taken for.
    pub model_id: String,

    /// Caller-supplied context.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// When the hold was taken.
    pub created_at: DateTime<Utc>,

    /// When the hold reached its terminal status.
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,

    /// Why the hold was released, if it was.
    #[serde(default)]
    pub release_reason: Option<String>,
}

impl Reservation {
    /// Create a new pending reservation.
    #[must_use]
    pub fn pending(
        task_id: TaskId,
        user_id: UserId,
        amount: Decimal,
        model_id: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            task_id,
            user_id,
            amount,
            status: ReservationStatus::Pending,
            model_id: model_id.into(),
            metadata,
            created_at: Utc::now(),
            settled_at: None,
            release_reason: None,
        }
    }

    /// Move to `Committed`. Returns `false` if already terminal.
    pub fn commit(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ReservationStatus::Committed;
        self.settled_at = Some(Utc::now());
        true
    }

    /// Move to `Released`. Returns `false` if already terminal.
    pub fn release(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ReservationStatus::Released;
        self.settled_at = Some(Utc::now());
        self.release_reason = Some(reason.into());
        true
    }
}

/// Result of a hold request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldOutcome {
    /// Funds were earmarked.
    Held,
    /// A reservation already exists for this task; nothing changed.
    AlreadyExists(ReservationStatus),
    /// Balance does not cover the amount; nothing changed.
    InsufficientFunds {
        /// Current balance.
        balance: Decimal,
        /// Requested amount.
        required: Decimal,
    },
}

impl HoldOutcome {
    /// Whether the caller may proceed with the paid action.
    ///
    /// An existing pending hold counts, since the funds are already earmarked.
    #[must_use]
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            Self::Held | Self::AlreadyExists(ReservationStatus::Pending)
        )
    }
}

/// Result of a commit or release request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// This call performed the transition.
    Settled,
    /// The reservation was already terminal; nothing changed.
    AlreadySettled(ReservationStatus),
    /// No reservation exists for the task.
    NotFound,
}

/// How a charge came to be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeSource {
    /// A pending hold was committed.
    ReservationCommit,
    /// The job price was subtracted after delivery, with no hold involved.
    DeliveryCharge,
}

/// Idempotency record for money permanently taken for a task.
///
/// Written in the same batch as the state change that spent the money, so a
/// task can be charged at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRecord {
    /// Task that was paid for.
    pub task_id: TaskId,
    /// Who paid.
    pub user_id: UserId,
    /// Amount spent.
    pub amount: Decimal,
    /// How the charge happened.
    pub source: ChargeSource,
    /// When the charge was recorded.
    pub charged_at: DateTime<Utc>,
}

impl ChargeRecord {
    /// Create a charge record stamped now.
    #[must_use]
    pub fn new(task_id: TaskId, user_id: UserId, amount: Decimal, source: ChargeSource) -> Self {
        Self {
            task_id,
            user_id,
            amount,
            source,
            charged_at: Utc::now(),
        }
    }
}
