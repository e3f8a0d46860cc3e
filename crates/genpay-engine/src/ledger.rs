//! Per-user balance ledger.
//!
//! Reads go straight to the store (which serves them from its cache). Every
//! write runs under the account lock, with the store write inside the
//! critical section.

use std::sync::Arc;

use rust_decimal::Decimal;

use genpay_core::{ensure_non_negative, Account, UserId, ValidationError};
use genpay_store::{Batch, Mutation, Store};

use crate::error::Result;
use crate::locks::Locks;

/// Balance operations for user accounts.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    locks: Arc<Locks>,
}

impl Ledger {
    /// Create a ledger over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, locks: Arc<Locks>) -> Self {
        Self { store, locks }
    }

    /// Get a user's balance.
    ///
    /// Unknown users have a balance of zero. A store failure is logged and
    /// also reads as zero.
    pub async fn get_balance(&self, user_id: UserId) -> Decimal {
        match self.store.get_account(user_id).await {
            Ok(Some(account)) => account.balance,
            Ok(None) => Decimal::ZERO,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Balance read failed, reporting zero");
                Decimal::ZERO
            }
        }
    }

    /// Get the full account record, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn get_account(&self, user_id: UserId) -> Result<Option<Account>> {
        Ok(self.store.get_account(user_id).await?)
    }

    /// Overwrite a user's balance.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative amount, or a store error if
    /// the write fails.
    pub async fn set_balance(&self, user_id: UserId, amount: Decimal) -> Result<()> {
        let amount = ensure_non_negative(amount)?;

        let _guard = self.locks.accounts.lock(&user_id).await;
        let mut account = self.load_or_new(user_id).await?;
        account.balance = amount;
        account.updated_at = chrono::Utc::now();
        self.store
            .apply(Batch::from(Mutation::PutAccount(account)))
            .await?;

        tracing::info!(user_id = %user_id, balance = %amount, "Balance set");
        Ok(())
    }

    /// Add `delta` (which may be negative) and return the new balance.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the result would be negative or does not
    /// fit in a decimal, or a store error if the write fails.
    pub async fn add_balance(&self, user_id: UserId, delta: Decimal) -> Result<Decimal> {
        let _guard = self.locks.accounts.lock(&user_id).await;
        let mut account = self.load_or_new(user_id).await?;

        let previous = account.balance;
        account.credit(delta)?;
        let new_balance = account.balance;
        if new_balance < Decimal::ZERO {
            return Err(ValidationError::BalanceWouldGoNegative {
                balance: previous,
                delta,
            }
            .into());
        }

        self.store
            .apply(Batch::from(Mutation::PutAccount(account)))
            .await?;

        tracing::info!(
            user_id = %user_id,
            delta = %delta,
            balance = %new_balance,
            "Balance adjusted"
        );
        Ok(new_balance)
    }

    /// Subtract `amount` if the balance covers it.
    ///
    /// Returns `false` without touching the account when funds are short.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative amount, or a store error if
    /// the write fails.
    pub async fn subtract_balance(&self, user_id: UserId, amount: Decimal) -> Result<bool> {
        let amount = ensure_non_negative(amount)?;

        let _guard = self.locks.accounts.lock(&user_id).await;
        let mut account = self.load_or_new(user_id).await?;

        if !account.try_debit(amount) {
            tracing::debug!(
                user_id = %user_id,
                balance = %account.balance,
                amount = %amount,
                "Subtract refused, insufficient funds"
            );
            return Ok(false);
        }
        account.record_spend(amount)?;

        self.store
            .apply(Batch::from(Mutation::PutAccount(account)))
            .await?;

        tracing::info!(user_id = %user_id, amount = %amount, "Balance debited");
        Ok(true)
    }

    async fn load_or_new(&self, user_id: UserId) -> Result<Account> {
        Ok(self
            .store
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| Account::new(user_id)))
    }
}
