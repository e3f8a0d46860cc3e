//! Atomic write sets.
//!
//! Every state change goes through a [`Batch`]. A backend applies all of a
//! batch's mutations or none of them, which is what lets a hold write the
//! reservation and the debited account together, or a delivery write the job,
//! the reservation and the charge record together.

use chrono::{DateTime, Utc};

use genpay_core::{
    Account, ChargeRecord, FreeUsageRecord, Job, Reservation, TaskId, UserId,
};

/// A single change to the durable state.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert or replace an account.
    PutAccount(Account),

    /// Insert or replace a reservation.
    PutReservation(Reservation),

    /// Insert or replace a charge record.
    PutCharge(ChargeRecord),

    /// Insert or replace a job.
    PutJob(Job),

    /// Remove a job.
    DeleteJob(TaskId),

    /// Drop jobs created before `created_before`, then the oldest ones beyond
    /// `max_jobs`.
    PruneJobs {
        /// TTL cutoff.
        created_before: DateTime<Utc>,
        /// Hard cap on stored jobs.
        max_jobs: usize,
    },

    /// Append a free-usage record.
    AppendFreeUsage(FreeUsageRecord),

    /// Remove the first free-usage record matching the triple.
    DeleteFreeUsage {
        /// User of the record.
        user_id: UserId,
        /// Model of the record.
        model_id: String,
        /// Job of the record.
        job_id: Option<String>,
    },

    /// Drop records created before `created_before`; if more than
    /// `max_records` remain, evict the oldest tenth (at least down to the cap).
    PruneFreeUsage {
        /// TTL cutoff.
        created_before: DateTime<Utc>,
        /// Hard cap on stored records.
        max_records: usize,
    },

    /// Record who referred `user_id`.
    PutReferral {
        /// The referred user.
        user_id: UserId,
        /// The referrer.
        referrer_id: UserId,
    },

    /// Set a user's accumulated referral bonus.
    PutReferralBonus {
        /// The referrer.
        user_id: UserId,
        /// New bonus total.
        bonus: u32,
    },

    /// Mark an inbound event as handled.
    PutProcessedEvent {
        /// Event identifier.
        event_id: String,
        /// When it was handled.
        processed_at: DateTime<Utc>,
    },

    /// Forget processed events older than the cutoff.
    PruneProcessedEvents {
        /// TTL cutoff.
        processed_before: DateTime<Utc>,
    },
}

/// An ordered set of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    mutations: Vec<Mutation>,
}

impl Batch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mutation.
    #[must_use]
    pub fn with(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    /// Add a mutation in place.
    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    /// Number of mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Whether the batch has no mutations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Borrow the mutations in order.
    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }
}

impl IntoIterator for Batch {
    type Item = Mutation;
    type IntoIter = std::vec::IntoIter<Mutation>;

    fn into_iter(self) -> Self::IntoIter {
        self.mutations.into_iter()
    }
}

impl From<Mutation> for Batch {
    fn from(mutation: Mutation) -> Self {
        Self::new().with(mutation)
    }
}

/// Number of oldest free-usage records to evict when a set of `len` records
/// exceeds `max_records`.
#[must_use]
pub fn free_usage_eviction_count(len: usize, max_records: usize) -> usize {
    if len <= max_records {
        return 0;
    }
    (len / 10).max(len - max_records)
}
