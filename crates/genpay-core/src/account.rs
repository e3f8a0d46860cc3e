//! Account types for genpay.
//!
//! An account is created the first time a balance operation touches a user and
//! is never deleted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};
use crate::UserId;

/// A balance account for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// The user ID.
    pub user_id: UserId,

    /// Spendable balance. Funds earmarked by a pending hold are already
    /// subtracted from this figure.
    pub balance: Decimal,

    /// Lifetime amount permanently spent (committed holds and
    /// charge-after-delivery).
    #[serde(default)]
    pub lifetime_spent: Decimal,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with zero balance.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            balance: Decimal::ZERO,
            lifetime_spent: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the account can cover `amount`.
    #[must_use]
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    /// Subtract `amount` if the balance covers it.
    ///
    /// Returns `false` and leaves the account untouched otherwise.
    pub fn try_debit(&mut self, amount: Decimal) -> bool {
        if !self.has_sufficient_funds(amount) {
            return false;
        }
        self.balance -= amount;
        self.updated_at = Utc::now();
        true
    }

    /// Add `amount` (which may be negative) to the balance.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::AmountOutOfRange`] if the sum does not fit
    /// in a decimal. The account is left untouched.
    pub fn credit(&mut self, amount: Decimal) -> Result<()> {
        self.balance = checked_sum(self.balance, amount)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record `amount` as permanently spent.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::AmountOutOfRange`] if the lifetime total
    /// overflows. The account is left untouched.
    pub fn record_spend(&mut self, amount: Decimal) -> Result<()> {
        self.lifetime_spent = checked_sum(self.lifetime_spent, amount)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn checked_sum(current: Decimal, amount: Decimal) -> Result<Decimal> {
    current
        .checked_add(amount)
        .ok_or_else(|| ValidationError::AmountOutOfRange(format!("{current} + {amount}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn debit_refuses_overdraft() {
        let mut account = Account::new(UserId::new(1).unwrap());
        account.credit(dec!(10)).unwrap();

        assert!(!account.try_debit(dec!(10.01)));
        assert_eq!(account.balance, dec!(10));

        assert!(account.try_debit(dec!(10)));
        assert_eq!(account.balance, Decimal::ZERO);
    }

    #[test]
    fn overflowing_credit_is_refused() {
        let mut account = Account::new(UserId::new(1).unwrap());
        account.credit(Decimal::MAX).unwrap();

        let err = account.credit(Decimal::ONE).unwrap_err();
        assert!(matches!(err, ValidationError::AmountOutOfRange(_)));
        assert_eq!(account.balance, Decimal::MAX);
    }

    #[test]
    fn overflowing_spend_is_refused() {
        let mut account = Account::new(UserId::new(1).unwrap());
        account.record_spend(Decimal::MAX).unwrap();

        assert!(account.record_spend(Decimal::ONE).is_err());
        assert_eq!(account.lifetime_spent, Decimal::MAX);
    }
}
