//! Settlement with retry and operator alerting.
//!
//! A commit or release that cannot be made durable loses money either way, so
//! store faults are retried with backoff. When the attempts run out an alert
//! is logged on the `genpay::alert` target and the caller gets
//! [`EngineError::SettlementFailed`]; the hold stays pending for
//! `expire_stale` to pick up.

use std::fmt;

use genpay_core::{SettleOutcome, TaskId};

use crate::error::{EngineError, Result};
use crate::reservations::ReservationManager;

/// Which way a reservation is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettlementAction {
    /// Keep the held funds.
    Commit,
    /// Return the held funds.
    Release,
}

impl SettlementAction {
    /// Get the action as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for SettlementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ReservationManager {
    /// Commit, retrying store faults.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SettlementFailed`] once the attempts run out.
    pub async fn commit_with_retry(&self, task_id: &TaskId) -> Result<SettleOutcome> {
        self.settle_with_retry(task_id, SettlementAction::Commit, "")
            .await
    }

    /// Release, retrying store faults.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SettlementFailed`] once the attempts run out.
    pub async fn release_with_retry(&self, task_id: &TaskId, reason: &str) -> Result<SettleOutcome> {
        self.settle_with_retry(task_id, SettlementAction::Release, reason)
            .await
    }

    /// Apply `action`, retrying store faults.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SettlementFailed`] once the attempts run out.
    pub async fn settle_with_retry(
        &self,
        task_id: &TaskId,
        action: SettlementAction,
        reason: &str,
    ) -> Result<SettleOutcome> {
        let result = self
            .settle_retry
            .run(
                action.as_str(),
                move || async move {
                    match action {
                        SettlementAction::Commit => self.commit(task_id).await,
                        SettlementAction::Release => self.release(task_id, reason).await,
                    }
                },
                EngineError::is_transient,
            )
            .await;

        result.map_err(|exhausted| {
            tracing::error!(
                target: "genpay::alert",
                task_id = %task_id,
                action = %action,
                attempts = %exhausted.attempts,
                error = %exhausted.error,
                "Settlement failed, hold left pending"
            );
            EngineError::SettlementFailed {
                task_id: task_id.clone(),
                action,
                attempts: exhausted.attempts,
            }
        })
    }
}
