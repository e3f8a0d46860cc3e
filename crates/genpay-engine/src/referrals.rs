//! Referrals and the hourly bonus they earn.

use std::sync::Arc;

use genpay_core::{ReferralInfo, UserId};
use genpay_store::{Batch, Mutation, Store};

use crate::config::FreeTierConfig;
use crate::error::Result;
use crate::locks::Locks;

/// Who referred whom, and the bonus that came of it.
#[derive(Clone)]
pub struct Referrals {
    store: Arc<dyn Store>,
    locks: Arc<Locks>,
    config: FreeTierConfig,
}

impl Referrals {
    /// Create a referral registry over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, locks: Arc<Locks>, config: FreeTierConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// Record that `referrer_id` brought in `user_id`.
    ///
    /// The referrer earns `referral_bonus_generations` in the same write.
    /// Returns `false` for a self-referral or when the user already has a
    /// referrer.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn set_referrer(&self, user_id: UserId, referrer_id: UserId) -> Result<bool> {
        if user_id == referrer_id {
            tracing::debug!(user_id = %user_id, "Self-referral ignored");
            return Ok(false);
        }

        let _guards = self.locks.lock_account_pair(user_id, referrer_id).await;
        if let Some(existing) = self.store.get_referrer(user_id).await? {
            tracing::debug!(
                user_id = %user_id,
                referrer_id = %existing,
                "Referrer already set"
            );
            return Ok(false);
        }

        let bonus = self
            .store
            .get_referral_bonus(referrer_id)
            .await?
            .saturating_add(self.config.referral_bonus_generations);
        self.store
            .apply(
                Batch::new()
                    .with(Mutation::PutReferral {
                        user_id,
                        referrer_id,
                    })
                    .with(Mutation::PutReferralBonus {
                        user_id: referrer_id,
                        bonus,
                    }),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            referrer_id = %referrer_id,
            bonus = %bonus,
            "Referral recorded"
        );
        Ok(true)
    }

    /// Users referred by `referrer_id`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn get_referrals(&self, referrer_id: UserId) -> Result<Vec<UserId>> {
        Ok(self.store.list_referrals(referrer_id).await?)
    }

    /// Accumulated bonus generations of a user.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn get_referral_bonus(&self, user_id: UserId) -> Result<u32> {
        Ok(self.store.get_referral_bonus(user_id).await?)
    }

    /// Referral standing of a user, with the hourly limit of the default
    /// free tier.
    ///
    /// # Errors
    ///
    /// Returns a store error if a read fails.
    pub async fn referral_info(&self, user_id: UserId) -> Result<ReferralInfo> {
        let referred_by = self.store.get_referrer(user_id).await?;
        let referrals = self.store.list_referrals(user_id).await?;
        let bonus_generations = self.store.get_referral_bonus(user_id).await?;

        Ok(ReferralInfo {
            user_id,
            referred_by,
            referrals_count: u32::try_from(referrals.len()).unwrap_or(u32::MAX),
            bonus_generations,
            hourly_limit: self
                .config
                .base_hourly_limit
                .saturating_add(bonus_generations),
        })
    }
}
