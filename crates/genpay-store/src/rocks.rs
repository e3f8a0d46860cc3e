//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Each [`Batch`] becomes one `RocksDB` `WriteBatch`, so the WAL gives the
//! all-or-nothing guarantee the JSON backend has to emulate with backups.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tokio::sync::Mutex;

use genpay_core::{
    Account, ChargeRecord, FreeUsageRecord, Job, Reservation, ReservationStatus, TaskId, UserId,
};

use crate::batch::{free_usage_eviction_count, Batch, Mutation};
use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::Store;

/// Free-usage changes staged earlier in the same batch. Committed state does
/// not show them yet, so later mutations consult this too.
#[derive(Default)]
struct Staged {
    deleted: HashSet<Vec<u8>>,
    appended: Vec<(Vec<u8>, FreeUsageRecord)>,
}

impl Staged {
    /// Committed records plus staged appends, minus staged deletes.
    fn live_free_usage(
        &self,
        committed: Vec<(Vec<u8>, FreeUsageRecord)>,
    ) -> impl Iterator<Item = (Vec<u8>, FreeUsageRecord)> + '_ {
        committed
            .into_iter()
            .chain(self.appended.iter().cloned())
            .filter(move |(key, _)| !self.deleted.contains(key))
    }
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Decode every entry of a column family, optionally restricted to a prefix.
    fn scan<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, T)>> {
        let cf = self.cf(cf_name)?;
        let mode = match prefix {
            Some(p) => IteratorMode::From(p, Direction::Forward),
            None => IteratorMode::Start,
        };

        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if let Some(p) = prefix {
                if !key.starts_with(p) {
                    break;
                }
            }
            out.push((key.to_vec(), Self::deserialize(&value)?));
        }
        Ok(out)
    }

    fn stage(&self, batch: &mut WriteBatch, staged: &mut Staged, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::PutAccount(account) => {
                let cf = self.cf(cf::ACCOUNTS)?;
                batch.put_cf(&cf, keys::account_key(account.user_id), Self::serialize(&account)?);
            }
            Mutation::PutReservation(reservation) => {
                let cf = self.cf(cf::RESERVATIONS)?;
                batch.put_cf(
                    &cf,
                    keys::task_key(&reservation.task_id),
                    Self::serialize(&reservation)?,
                );
            }
            Mutation::PutCharge(charge) => {
                let cf = self.cf(cf::CHARGES)?;
                batch.put_cf(&cf, keys::task_key(&charge.task_id), Self::serialize(&charge)?);
            }
            Mutation::PutJob(job) => {
                let cf = self.cf(cf::JOBS)?;
                batch.put_cf(&cf, keys::task_key(&job.task_id), Self::serialize(&job)?);
            }
            Mutation::DeleteJob(task_id) => {
                let cf = self.cf(cf::JOBS)?;
                batch.delete_cf(&cf, keys::task_key(&task_id));
            }
            Mutation::PruneJobs {
                created_before,
                max_jobs,
            } => {
                let cf = self.cf(cf::JOBS)?;
                let mut live: Vec<(DateTime<Utc>, Vec<u8>)> = Vec::new();
                for (key, job) in self.scan::<Job>(cf::JOBS, None)? {
                    if job.created_at < created_before {
                        batch.delete_cf(&cf, &key);
                    } else {
                        live.push((job.created_at, key));
                    }
                }
                if live.len() > max_jobs {
                    live.sort();
                    let excess = live.len() - max_jobs;
                    for (_, key) in live.into_iter().take(excess) {
                        batch.delete_cf(&cf, &key);
                    }
                }
            }
            Mutation::AppendFreeUsage(record) => {
                let cf = self.cf(cf::FREE_USAGE)?;
                let key = keys::free_usage_key(
                    record.user_id,
                    &record.model_id,
                    record.created_at,
                    uuid::Uuid::new_v4().into_bytes(),
                );
                batch.put_cf(&cf, &key, Self::serialize(&record)?);
                staged.appended.push((key, record));
            }
            Mutation::DeleteFreeUsage {
                user_id,
                model_id,
                job_id,
            } => {
                let cf = self.cf(cf::FREE_USAGE)?;
                let prefix = keys::free_usage_prefix(user_id, &model_id);
                let committed = self.scan::<FreeUsageRecord>(cf::FREE_USAGE, Some(&prefix))?;
                let target = staged
                    .live_free_usage(committed)
                    .find(|(_, record)| record.matches(user_id, &model_id, job_id.as_deref()));
                if let Some((key, _)) = target {
                    batch.delete_cf(&cf, &key);
                    staged.deleted.insert(key);
                }
            }
            Mutation::PruneFreeUsage {
                created_before,
                max_records,
            } => {
                let cf = self.cf(cf::FREE_USAGE)?;
                let committed = self.scan::<FreeUsageRecord>(cf::FREE_USAGE, None)?;
                let mut expired = Vec::new();
                let mut live: Vec<(DateTime<Utc>, Vec<u8>)> = Vec::new();
                for (key, record) in staged.live_free_usage(committed) {
                    if record.created_at < created_before {
                        expired.push(key);
                    } else {
                        live.push((record.created_at, key));
                    }
                }
                for key in expired {
                    batch.delete_cf(&cf, &key);
                    staged.deleted.insert(key);
                }
                let evict = free_usage_eviction_count(live.len(), max_records);
                if evict > 0 {
                    live.sort();
                    for (_, key) in live.into_iter().take(evict) {
                        batch.delete_cf(&cf, &key);
                        staged.deleted.insert(key);
                    }
                    tracing::warn!(evicted = %evict, "Free usage records over cap, evicted oldest");
                }
            }
            Mutation::PutReferral {
                user_id,
                referrer_id,
            } => {
                let cf = self.cf(cf::REFERRALS)?;
                batch.put_cf(&cf, keys::account_key(user_id), Self::serialize(&referrer_id)?);
            }
            Mutation::PutReferralBonus { user_id, bonus } => {
                let cf = self.cf(cf::REFERRAL_BONUSES)?;
                batch.put_cf(&cf, keys::account_key(user_id), Self::serialize(&bonus)?);
            }
            Mutation::PutProcessedEvent {
                event_id,
                processed_at,
            } => {
                let cf = self.cf(cf::PROCESSED_EVENTS)?;
                batch.put_cf(&cf, keys::event_key(&event_id), Self::serialize(&processed_at)?);
            }
            Mutation::PruneProcessedEvents { processed_before } => {
                let cf = self.cf(cf::PROCESSED_EVENTS)?;
                for (key, at) in self.scan::<DateTime<Utc>>(cf::PROCESSED_EVENTS, None)? {
                    if at < processed_before {
                        batch.delete_cf(&cf, &key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RocksStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn get_account(&self, user_id: UserId) -> Result<Option<Account>> {
        self.get_value(cf::ACCOUNTS, &keys::account_key(user_id))
    }

    // =========================================================================
    // Reservation Operations
    // =========================================================================

    async fn get_reservation(&self, task_id: &TaskId) -> Result<Option<Reservation>> {
        self.get_value(cf::RESERVATIONS, &keys::task_key(task_id))
    }

    async fn list_reservations(&self, status: ReservationStatus) -> Result<Vec<Reservation>> {
        Ok(self
            .scan::<Reservation>(cf::RESERVATIONS, None)?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.status == status)
            .collect())
    }

    async fn get_charge(&self, task_id: &TaskId) -> Result<Option<ChargeRecord>> {
        self.get_value(cf::CHARGES, &keys::task_key(task_id))
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    async fn get_job(&self, task_id: &TaskId) -> Result<Option<Job>> {
        self.get_value(cf::JOBS, &keys::task_key(task_id))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .scan::<Job>(cf::JOBS, None)?
            .into_iter()
            .map(|(_, job)| job)
            .collect())
    }

    // =========================================================================
    // Free Usage Operations
    // =========================================================================

    async fn list_free_usage(
        &self,
        user_id: UserId,
        model_id: &str,
    ) -> Result<Vec<FreeUsageRecord>> {
        let prefix = keys::free_usage_prefix(user_id, model_id);
        Ok(self
            .scan::<FreeUsageRecord>(cf::FREE_USAGE, Some(&prefix))?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    // =========================================================================
    // Referral Operations
    // =========================================================================

    async fn get_referrer(&self, user_id: UserId) -> Result<Option<UserId>> {
        self.get_value(cf::REFERRALS, &keys::account_key(user_id))
    }

    async fn list_referrals(&self, referrer_id: UserId) -> Result<Vec<UserId>> {
        let mut users = Vec::new();
        for (key, referrer) in self.scan::<UserId>(cf::REFERRALS, None)? {
            if referrer != referrer_id {
                continue;
            }
            let raw: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corruption("malformed referral key".into()))?;
            let user = UserId::new(i64::from_be_bytes(raw))
                .map_err(|e| StoreError::Corruption(e.to_string()))?;
            users.push(user);
        }
        Ok(users)
    }

    async fn get_referral_bonus(&self, user_id: UserId) -> Result<u32> {
        Ok(self
            .get_value::<u32>(cf::REFERRAL_BONUSES, &keys::account_key(user_id))?
            .unwrap_or(0))
    }

    // =========================================================================
    // Event Operations
    // =========================================================================

    async fn has_processed_event(&self, event_id: &str) -> Result<bool> {
        let cf = self.cf(cf::PROCESSED_EVENTS)?;
        let exists = self
            .db
            .get_cf(&cf, keys::event_key(event_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        Ok(exists)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn apply(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let mut write = WriteBatch::default();
        let mut staged = Staged::default();
        for mutation in batch {
            self.stage(&mut write, &mut staged, mutation)?;
        }

        self.db
            .write(write)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }
}
