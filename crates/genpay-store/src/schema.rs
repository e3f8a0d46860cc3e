//! Storage schema definitions.
//!
//! The JSON backend keeps the whole ledger in one [`LedgerDocument`]; the
//! `RocksDB` backend spreads the same records over the column families in
//! [`cf`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use genpay_core::{
    Account, ChargeRecord, FreeUsageRecord, Job, Reservation, TaskId, UserId,
};

use crate::batch::{free_usage_eviction_count, Batch, Mutation};

/// Current document layout version.
pub const SCHEMA_VERSION: u32 = 1;

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Account records, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Reservations, keyed by `task_id`.
    pub const RESERVATIONS: &str = "reservations";

    /// Charge idempotency records, keyed by `task_id`.
    pub const CHARGES: &str = "charges";

    /// Jobs, keyed by `task_id`.
    pub const JOBS: &str = "jobs";

    /// Free-usage records, keyed by `user_id || model_id || 0x00 || created_at || nonce`.
    pub const FREE_USAGE: &str = "free_usage";

    /// Referrer of each user, keyed by `user_id`.
    pub const REFERRALS: &str = "referrals";

    /// Accumulated referral bonus, keyed by `user_id`.
    pub const REFERRAL_BONUSES: &str = "referral_bonuses";

    /// Processed inbound events, keyed by `event_id`.
    pub const PROCESSED_EVENTS: &str = "processed_events";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::RESERVATIONS,
        cf::CHARGES,
        cf::JOBS,
        cf::FREE_USAGE,
        cf::REFERRALS,
        cf::REFERRAL_BONUSES,
        cf::PROCESSED_EVENTS,
    ]
}

/// Document bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Layout version.
    pub version: u32,
    /// When the document was first written.
    pub created_at: DateTime<Utc>,
    /// When the document was last written.
    pub updated_at: DateTime<Utc>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The complete ledger as a single serializable document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    /// Bookkeeping.
    #[serde(default)]
    pub metadata: DocumentMetadata,

    /// Accounts by user.
    #[serde(default)]
    pub accounts: BTreeMap<UserId, Account>,

    /// Reservations by task.
    #[serde(default)]
    pub reservations: BTreeMap<TaskId, Reservation>,

    /// Charge idempotency records by task.
    #[serde(default)]
    pub charges: BTreeMap<TaskId, ChargeRecord>,

    /// Jobs by task.
    #[serde(default)]
    pub jobs: BTreeMap<TaskId, Job>,

    /// Free-usage records in append order.
    #[serde(default)]
    pub free_usage: Vec<FreeUsageRecord>,

    /// Referrer of each referred user.
    #[serde(default)]
    pub referrals: BTreeMap<UserId, UserId>,

    /// Accumulated bonus per referrer.
    #[serde(default)]
    pub referral_bonuses: BTreeMap<UserId, u32>,

    /// Processed inbound events.
    #[serde(default)]
    pub processed_events: BTreeMap<String, DateTime<Utc>>,
}

impl LedgerDocument {
    /// Apply every mutation of a batch in order.
    pub fn apply(&mut self, batch: Batch) {
        for mutation in batch {
            self.apply_one(mutation);
        }
        self.metadata.updated_at = Utc::now();
    }

    fn apply_one(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::PutAccount(account) => {
                self.accounts.insert(account.user_id, account);
            }
            Mutation::PutReservation(reservation) => {
                self.reservations
                    .insert(reservation.task_id.clone(), reservation);
            }
            Mutation::PutCharge(charge) => {
                self.charges.insert(charge.task_id.clone(), charge);
            }
            Mutation::PutJob(job) => {
                self.jobs.insert(job.task_id.clone(), job);
            }
            Mutation::DeleteJob(task_id) => {
                self.jobs.remove(&task_id);
            }
            Mutation::PruneJobs {
                created_before,
                max_jobs,
            } => self.prune_jobs(created_before, max_jobs),
            Mutation::AppendFreeUsage(record) => self.free_usage.push(record),
            Mutation::DeleteFreeUsage {
                user_id,
                model_id,
                job_id,
            } => {
                if let Some(pos) = self
                    .free_usage
                    .iter()
                    .position(|r| r.matches(user_id, &model_id, job_id.as_deref()))
                {
                    self.free_usage.remove(pos);
                }
            }
            Mutation::PruneFreeUsage {
                created_before,
                max_records,
            } => self.prune_free_usage(created_before, max_records),
            Mutation::PutReferral {
                user_id,
                referrer_id,
            } => {
                self.referrals.insert(user_id, referrer_id);
            }
            Mutation::PutReferralBonus { user_id, bonus } => {
                self.referral_bonuses.insert(user_id, bonus);
            }
            Mutation::PutProcessedEvent {
                event_id,
                processed_at,
            } => {
                self.processed_events.insert(event_id, processed_at);
            }
            Mutation::PruneProcessedEvents { processed_before } => {
                self.processed_events.retain(|_, at| *at >= processed_before);
            }
        }
    }

    fn prune_jobs(&mut self, created_before: DateTime<Utc>, max_jobs: usize) {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| job.created_at >= created_before);

        if self.jobs.len() > max_jobs {
            let mut by_age: Vec<(DateTime<Utc>, TaskId)> = self
                .jobs
                .values()
                .map(|job| (job.created_at, job.task_id.clone()))
                .collect();
            by_age.sort();
            let excess = self.jobs.len() - max_jobs;
            for (_, task_id) in by_age.into_iter().take(excess) {
                self.jobs.remove(&task_id);
            }
        }

        let removed = before - self.jobs.len();
        if removed > 0 {
            tracing::debug!(removed = %removed, remaining = %self.jobs.len(), "Pruned jobs");
        }
    }

    fn prune_free_usage(&mut self, created_before: DateTime<Utc>, max_records: usize) {
        self.free_usage.retain(|r| r.created_at >= created_before);

        let evict = free_usage_eviction_count(self.free_usage.len(), max_records);
        if evict > 0 {
            self.free_usage.sort_by_key(|r| r.created_at);
            self.free_usage.drain(..evict);
            tracing::warn!(
                evicted = %evict,
                remaining = %self.free_usage.len(),
                "Free usage records over cap, evicted oldest"
            );
        }
    }

    /// Check the invariants a persisted document must satisfy.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata.version > SCHEMA_VERSION {
            return Err(format!(
                "document version {} is newer than supported {SCHEMA_VERSION}",
                self.metadata.version
            ));
        }
        for (user_id, account) in &self.accounts {
            if account.user_id != *user_id {
                return Err(format!(
                    "account stored under {user_id} belongs to {}",
                    account.user_id
                ));
            }
            if account.balance < Decimal::ZERO {
                return Err(format!("negative balance for user {user_id}"));
            }
        }
        for (task_id, reservation) in &self.reservations {
            if reservation.task_id != *task_id {
                return Err(format!("reservation key mismatch for {task_id}"));
            }
            if reservation.amount < Decimal::ZERO {
                return Err(format!("negative reservation amount for {task_id}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use genpay_core::NewJob;
    use rust_decimal_macros::dec;

    fn user(id: i64) -> UserId {
        UserId::new(id).unwrap()
    }

    fn job_created(id: &str, created_at: DateTime<Utc>) -> Job {
        let mut job = Job::new(NewJob {
            task_id: TaskId::new(id).unwrap(),
            user_id: user(1),
            chat_id: None,
            model_id: "m".into(),
            params: serde_json::Value::Null,
            price: Decimal::ZERO,
        });
        job.created_at = created_at;
        job
    }

    #[test]
    fn prune_jobs_by_ttl_then_cap() {
        let now = Utc::now();
        let mut doc = LedgerDocument::default();
        doc.apply(
            Batch::new()
                .with(Mutation::PutJob(job_created("old", now - Duration::hours(2))))
                .with(Mutation::PutJob(job_created("a", now - Duration::minutes(30))))
                .with(Mutation::PutJob(job_created("b", now - Duration::minutes(20))))
                .with(Mutation::PutJob(job_created("c", now - Duration::minutes(10)))),
        );

        doc.apply(Batch::from(Mutation::PruneJobs {
            created_before: now - Duration::hours(1),
            max_jobs: 2,
        }));

        let keys: Vec<&str> = doc.jobs.keys().map(TaskId::as_str).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn delete_free_usage_removes_one_match() {
        let mut doc = LedgerDocument::default();
        let record = FreeUsageRecord::new(user(1), "z-image", Some("j1".into()));
        doc.apply(
            Batch::new()
                .with(Mutation::AppendFreeUsage(record.clone()))
                .with(Mutation::AppendFreeUsage(record)),
        );

        doc.apply(Batch::from(Mutation::DeleteFreeUsage {
            user_id: user(1),
            model_id: "z-image".into(),
            job_id: Some("j1".into()),
        }));

        assert_eq!(doc.free_usage.len(), 1);
    }

    #[test]
    fn validate_rejects_negative_balance() {
        let mut doc = LedgerDocument::default();
        let mut account = Account::new(user(3));
        account.balance = dec!(-1);
        doc.accounts.insert(user(3), account);
        assert!(doc.validate().is_err());
    }

    #[test]
    fn document_roundtrip_keeps_keys() {
        let mut doc = LedgerDocument::default();
        let mut account = Account::new(user(9));
        account.balance = dec!(100.50);
        doc.apply(Batch::from(Mutation::PutAccount(account)));

        let json = serde_json::to_string(&doc).unwrap();
        let back: LedgerDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.accounts[&user(9)].balance, dec!(100.50));
    }
}
