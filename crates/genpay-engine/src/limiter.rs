//! Free-tier usage limiter.
//!
//! Free generations are counted per (user, model) over the current local hour
//! and the current local day. Check and append happen under the user's lock
//! with the append, the pruning and nothing else in one batch, so two racing
//! requests can never both take the last slot.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use genpay_core::{FreeUsageRecord, LimitDecision, LimitReason, UsageWindows, UserId};
use genpay_store::{Batch, Mutation, Store};

use crate::config::{FreeTierConfig, RetentionConfig};
use crate::error::Result;
use crate::jobs::to_chrono;
use crate::locks::Locks;

/// Atomic check-and-reserve for free generations.
#[derive(Clone)]
pub struct FreeUsageLimiter {
    store: Arc<dyn Store>,
    locks: Arc<Locks>,
    config: FreeTierConfig,
    free_usage_ttl: Duration,
    max_records: usize,
}

impl FreeUsageLimiter {
    /// Create a limiter over a store.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<Locks>,
        config: FreeTierConfig,
        retention: &RetentionConfig,
    ) -> Self {
        Self {
            store,
            locks,
            config,
            free_usage_ttl: retention.free_usage_ttl,
            max_records: retention.max_free_usage_records,
        }
    }

    /// Whether `model_id` has a free tier.
    #[must_use]
    pub fn is_free_model(&self, model_id: &str) -> bool {
        self.config.is_free_model(model_id)
    }

    /// Free-tier settings in use.
    #[must_use]
    pub fn config(&self) -> &FreeTierConfig {
        &self.config
    }

    /// Hourly limit for the user on `model_id`, referral bonus included.
    ///
    /// # Errors
    ///
    /// Returns a store error if the bonus cannot be read.
    pub async fn hourly_limit(&self, user_id: UserId, model_id: &str) -> Result<u32> {
        let bonus = self.store.get_referral_bonus(user_id).await?;
        Ok(self
            .config
            .base_hourly_limit_for(model_id)
            .saturating_add(bonus))
    }

    /// Report where the user stands without consuming a slot.
    ///
    /// # Errors
    ///
    /// Returns a store error if the usage cannot be read.
    pub async fn check_limits(&self, user_id: UserId, model_id: &str) -> Result<LimitDecision> {
        if !self.is_free_model(model_id) {
            return Ok(LimitDecision::not_free());
        }
        let records = self.store.list_free_usage(user_id, model_id).await?;
        let (hourly_used, daily_used) = UsageWindows::now().count(&records);
        let hourly_limit = self.hourly_limit(user_id, model_id).await?;
        Ok(self.decide(hourly_used, hourly_limit, daily_used))
    }

    /// Take one free slot if both windows have room.
    ///
    /// The daily window is checked first. When allowed, the returned counts
    /// include the new record. A repeated call with the same `job_id` does
    /// not take a second slot.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn check_limits_and_reserve(
        &self,
        user_id: UserId,
        model_id: &str,
        job_id: Option<&str>,
    ) -> Result<LimitDecision> {
        if !self.is_free_model(model_id) {
            return Ok(LimitDecision::not_free());
        }

        let _guard = self.locks.accounts.lock(&user_id).await;
        let records = self.store.list_free_usage(user_id, model_id).await?;
        let windows = UsageWindows::now();
        let (hourly_used, daily_used) = windows.count(&records);
        let hourly_limit = self.hourly_limit(user_id, model_id).await?;

        if job_id.is_some() && records.iter().any(|r| r.matches(user_id, model_id, job_id)) {
            tracing::debug!(
                user_id = %user_id,
                model_id = %model_id,
                job_id = ?job_id,
                "Free slot already taken for this job"
            );
            return Ok(LimitDecision {
                allowed: true,
                reason: LimitReason::Ok,
                hourly_used,
                hourly_limit,
                daily_used,
                daily_limit: self.config.daily_limit,
            });
        }

        let decision = self.decide(hourly_used, hourly_limit, daily_used);
        if !decision.allowed {
            tracing::info!(
                user_id = %user_id,
                model_id = %model_id,
                reason = %decision.reason.as_str(),
                hourly_used = %hourly_used,
                daily_used = %daily_used,
                "Free generation refused"
            );
            return Ok(decision);
        }

        let record = FreeUsageRecord::new(user_id, model_id, job_id.map(str::to_string));
        self.store
            .apply(
                Batch::new()
                    .with(Mutation::AppendFreeUsage(record))
                    .with(Mutation::PruneFreeUsage {
                        created_before: Utc::now() - to_chrono(self.free_usage_ttl),
                        max_records: self.max_records,
                    }),
            )
            .await?;

        let decision = LimitDecision {
            hourly_used: hourly_used.saturating_add(1),
            daily_used: daily_used.saturating_add(1),
            ..decision
        };
        tracing::debug!(
            user_id = %user_id,
            model_id = %model_id,
            hourly_used = %decision.hourly_used,
            hourly_limit = %decision.hourly_limit,
            "Free slot reserved"
        );
        Ok(decision)
    }

    /// Give back the slot taken for `job_id`.
    ///
    /// A slot whose job produced results or was delivered is kept; returns
    /// `false` for those and when no record matches.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn delete_usage(
        &self,
        user_id: UserId,
        model_id: &str,
        job_id: Option<&str>,
    ) -> Result<bool> {
        if let Some(job_id) = job_id {
            if let Ok(task_id) = genpay_core::TaskId::new(job_id) {
                if let Some(job) = self.store.get_job(&task_id).await? {
                    if job.is_delivered() || !job.result_urls.is_empty() {
                        tracing::warn!(
                            user_id = %user_id,
                            model_id = %model_id,
                            job_id = %job_id,
                            "Refusing to return free slot of a job with results"
                        );
                        return Ok(false);
                    }
                }
            }
        }

        let _guard = self.locks.accounts.lock(&user_id).await;
        let records = self.store.list_free_usage(user_id, model_id).await?;
        if !records.iter().any(|r| r.matches(user_id, model_id, job_id)) {
            return Ok(false);
        }

        self.store
            .apply(Batch::from(Mutation::DeleteFreeUsage {
                user_id,
                model_id: model_id.to_string(),
                job_id: job_id.map(str::to_string),
            }))
            .await?;

        tracing::info!(user_id = %user_id, model_id = %model_id, job_id = ?job_id, "Free slot returned");
        Ok(true)
    }

    fn decide(&self, hourly_used: u32, hourly_limit: u32, daily_used: u32) -> LimitDecision {
        let daily_limit = self.config.daily_limit;
        let reason = if daily_used >= daily_limit {
            LimitReason::DailyLimitExceeded
        } else if hourly_used >= hourly_limit {
            LimitReason::HourlyLimitExceeded
        } else {
            LimitReason::Ok
        };
        LimitDecision {
            allowed: reason == LimitReason::Ok,
            reason,
            hourly_used,
            hourly_limit,
            daily_used,
            daily_limit,
        }
    }
}
