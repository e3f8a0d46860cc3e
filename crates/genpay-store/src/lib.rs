//! Durable storage for genpay.
//!
//! This crate persists accounts, reservations, charge records, jobs, free-usage
//! records, referrals and processed events behind the [`Store`] trait.
//!
//! # Backends
//!
//! - [`JsonFileStore`]: one JSON document with a backup mirror, write
//!   verification and an in-memory read cache. This is the default.
//! - `RocksStore` (feature `rocksdb-backend`): column families written with
//!   atomic `WriteBatch`es.
//!
//! # Writes
//!
//! All changes go through [`Store::apply`] with a [`Batch`]. A batch is applied
//! entirely or not at all. Callers that need read-modify-write semantics must
//! serialize themselves (the engine holds per-account and per-task locks
//! across the read and the `apply`).
//!
//! # Example
//!
//! ```no_run
//! use genpay_core::{Account, UserId};
//! use genpay_store::{Batch, FileStoreOptions, JsonFileStore, Mutation, Store};
//!
//! # async fn example() -> genpay_store::Result<()> {
//! let store = JsonFileStore::open("/tmp/genpay/ledger.json", FileStoreOptions::default()).await?;
//!
//! let user_id = UserId::new(42).unwrap();
//! store.apply(Batch::from(Mutation::PutAccount(Account::new(user_id)))).await?;
//!
//! let account = store.get_account(user_id).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod error;
pub mod file;
#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use batch::{Batch, Mutation};
pub use error::{Result, StoreError};
pub use file::{FileStoreOptions, JsonFileStore};
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;
pub use schema::LedgerDocument;

use async_trait::async_trait;

use genpay_core::{
    Account, ChargeRecord, FreeUsageRecord, Job, Reservation, ReservationStatus, TaskId, UserId,
};

/// The storage trait defining all durable operations.
///
/// Implementations are shared across tasks behind an `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    async fn get_account(&self, user_id: UserId) -> Result<Option<Account>>;

    // =========================================================================
    // Reservation Operations
    // =========================================================================

    /// Get a reservation by task ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    async fn get_reservation(&self, task_id: &TaskId) -> Result<Option<Reservation>>;

    /// List reservations with the given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read or decoded.
    async fn list_reservations(&self, status: ReservationStatus) -> Result<Vec<Reservation>>;

    /// Get the charge record for a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    async fn get_charge(&self, task_id: &TaskId) -> Result<Option<ChargeRecord>>;

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Get a job by task ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    async fn get_job(&self, task_id: &TaskId) -> Result<Option<Job>>;

    /// List all stored jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read or decoded.
    async fn list_jobs(&self) -> Result<Vec<Job>>;

    // =========================================================================
    // Free Usage Operations
    // =========================================================================

    /// List free-usage records for a (user, model) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read or decoded.
    async fn list_free_usage(&self, user_id: UserId, model_id: &str)
        -> Result<Vec<FreeUsageRecord>>;

    // =========================================================================
    // Referral Operations
    // =========================================================================

    /// Get the user who referred `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    async fn get_referrer(&self, user_id: UserId) -> Result<Option<UserId>>;

    /// List users referred by `referrer_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read or decoded.
    async fn list_referrals(&self, referrer_id: UserId) -> Result<Vec<UserId>>;

    /// Get a user's accumulated referral bonus (0 if none).
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    async fn get_referral_bonus(&self, user_id: UserId) -> Result<u32>;

    // =========================================================================
    // Event Operations (for idempotency)
    // =========================================================================

    /// Check if an inbound event has already been handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    async fn has_processed_event(&self, event_id: &str) -> Result<bool>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a batch of mutations atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be made durable. In that case
    /// none of its mutations are visible.
    async fn apply(&self, batch: Batch) -> Result<()>;
}
