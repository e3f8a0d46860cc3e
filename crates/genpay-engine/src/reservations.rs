//! Charge reservations: hold, then commit or release exactly once.
//!
//! A hold earmarks funds by taking them off the visible balance. Commit makes
//! the earmark permanent and writes the task's [`ChargeRecord`]. Release puts
//! the funds back. Both check the current status under the task lock, so the
//! second of two racing settlements always sees the first one's result.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use genpay_core::{
    ensure_non_negative, Account, ChargeRecord, ChargeSource, HoldOutcome, Reservation,
    ReservationStatus, SettleOutcome, TaskId, UserId,
};
use genpay_store::{Batch, Mutation, Store};

use crate::error::Result;
use crate::jobs::to_chrono;
use crate::locks::Locks;
use crate::retry::RetryPolicy;

/// Reason recorded when a hold outlives the reservation TTL.
pub const EXPIRED_REASON: &str = "expired";

/// Hold, commit and release of task reservations.
#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn Store>,
    locks: Arc<Locks>,
    pub(crate) settle_retry: RetryPolicy,
}

impl ReservationManager {
    /// Create a manager over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, locks: Arc<Locks>) -> Self {
        Self {
            store,
            locks,
            settle_retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy used by the `*_with_retry` settlements.
    #[must_use]
    pub fn with_settle_retry(mut self, policy: RetryPolicy) -> Self {
        self.settle_retry = policy;
        self
    }

    /// Earmark `amount` of the user's balance for `task_id`.
    ///
    /// Idempotent: if a reservation for the task exists, its status is
    /// returned and nothing changes.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative amount, or a store error if
    /// the write fails.
    pub async fn hold(
        &self,
        task_id: &TaskId,
        user_id: UserId,
        amount: Decimal,
        model_id: &str,
        metadata: serde_json::Value,
    ) -> Result<HoldOutcome> {
        let amount = ensure_non_negative(amount)?;

        let _task = self.locks.tasks.lock(task_id).await;
        if let Some(existing) = self.store.get_reservation(task_id).await? {
            tracing::debug!(
                task_id = %task_id,
                status = %existing.status.as_str(),
                "Hold already exists"
            );
            return Ok(HoldOutcome::AlreadyExists(existing.status));
        }

        let _account = self.locks.accounts.lock(&user_id).await;
        let mut account = self
            .store
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| Account::new(user_id));

        if !account.try_debit(amount) {
            tracing::info!(
                task_id = %task_id,
                user_id = %user_id,
                balance = %account.balance,
                required = %amount,
                "Hold refused, insufficient funds"
            );
            return Ok(HoldOutcome::InsufficientFunds {
                balance: account.balance,
                required: amount,
            });
        }

        let reservation = Reservation::pending(task_id.clone(), user_id, amount, model_id, metadata);
        self.store
            .apply(
                Batch::new()
                    .with(Mutation::PutAccount(account))
                    .with(Mutation::PutReservation(reservation)),
            )
            .await?;

        tracing::info!(
            task_id = %task_id,
            user_id = %user_id,
            amount = %amount,
            model_id = %model_id,
            "Funds held"
        );
        Ok(HoldOutcome::Held)
    }

    /// Make a pending hold permanent.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn commit(&self, task_id: &TaskId) -> Result<SettleOutcome> {
        let _task = self.locks.tasks.lock(task_id).await;
        let Some(mut reservation) = self.store.get_reservation(task_id).await? else {
            tracing::warn!(task_id = %task_id, "Commit for unknown reservation");
            return Ok(SettleOutcome::NotFound);
        };
        if reservation.status.is_terminal() {
            tracing::debug!(
                task_id = %task_id,
                status = %reservation.status.as_str(),
                "Commit ignored, already settled"
            );
            return Ok(SettleOutcome::AlreadySettled(reservation.status));
        }

        let user_id = reservation.user_id;
        let amount = reservation.amount;
        let _account = self.locks.accounts.lock(&user_id).await;
        let mut account = self
            .store
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| Account::new(user_id));
        account.record_spend(amount)?;
        reservation.commit();

        self.store
            .apply(
                Batch::new()
                    .with(Mutation::PutReservation(reservation))
                    .with(Mutation::PutAccount(account))
                    .with(Mutation::PutCharge(ChargeRecord::new(
                        task_id.clone(),
                        user_id,
                        amount,
                        ChargeSource::ReservationCommit,
                    ))),
            )
            .await?;

        tracing::info!(task_id = %task_id, user_id = %user_id, amount = %amount, "Hold committed");
        Ok(SettleOutcome::Settled)
    }

    /// Cancel a pending hold and return the funds.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn release(&self, task_id: &TaskId, reason: &str) -> Result<SettleOutcome> {
        let _task = self.locks.tasks.lock(task_id).await;
        let Some(mut reservation) = self.store.get_reservation(task_id).await? else {
            tracing::warn!(task_id = %task_id, reason = %reason, "Release for unknown reservation");
            return Ok(SettleOutcome::NotFound);
        };
        if reservation.status.is_terminal() {
            tracing::debug!(
                task_id = %task_id,
                status = %reservation.status.as_str(),
                "Release ignored, already settled"
            );
            return Ok(SettleOutcome::AlreadySettled(reservation.status));
        }

        let user_id = reservation.user_id;
        let amount = reservation.amount;
        let _account = self.locks.accounts.lock(&user_id).await;
        let mut account = self
            .store
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| Account::new(user_id));
        account.credit(amount)?;
        reservation.release(reason);

        self.store
            .apply(
                Batch::new()
                    .with(Mutation::PutReservation(reservation))
                    .with(Mutation::PutAccount(account)),
            )
            .await?;

        tracing::info!(
            task_id = %task_id,
            user_id = %user_id,
            amount = %amount,
            reason = %reason,
            "Hold released"
        );
        Ok(SettleOutcome::Settled)
    }

    /// Get a reservation by task.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn get(&self, task_id: &TaskId) -> Result<Option<Reservation>> {
        Ok(self.store.get_reservation(task_id).await?)
    }

    /// List holds that are still pending.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn list_pending(&self) -> Result<Vec<Reservation>> {
        Ok(self
            .store
            .list_reservations(ReservationStatus::Pending)
            .await?)
    }

    /// Release pending holds created more than `older_than` ago.
    ///
    /// Returns how many holds this call released.
    ///
    /// # Errors
    ///
    /// Returns a store error if listing fails. Individual release failures are
    /// logged and skipped so one bad record does not block the rest.
    pub async fn expire_stale(&self, older_than: std::time::Duration) -> Result<usize> {
        let cutoff = Utc::now() - to_chrono(older_than);

        let mut released = 0;
        for reservation in self.list_pending().await? {
            if reservation.created_at >= cutoff {
                continue;
            }
            match self.release(&reservation.task_id, EXPIRED_REASON).await {
                Ok(SettleOutcome::Settled) => released += 1,
                Ok(_) => {}
                Err(e) => tracing::error!(
                    task_id = %reservation.task_id,
                    error = %e,
                    "Failed to expire stale hold"
                ),
            }
        }

        if released > 0 {
            tracing::info!(released = %released, "Expired stale holds");
        }
        Ok(released)
    }
}
