//! JSON document storage implementation.
//!
//! The whole ledger lives in one JSON file next to a `.backup` mirror. Each
//! write follows the same discipline:
//!
//! 1. copy the current file to the backup,
//! 2. write the new document to a temp file and rename it over the original,
//! 3. read the file back and validate it,
//! 4. on any failure, copy the backup back and report the error.
//!
//! Reads are served from an in-memory copy of the last document that was
//! successfully written or loaded. A failed write drops that copy so the next
//! read goes back to disk. If such a read times out, the last known document is
//! served and the store logs that it is running degraded.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use genpay_core::{
    Account, ChargeRecord, FreeUsageRecord, Job, Reservation, ReservationStatus, TaskId, UserId,
};

use crate::batch::Batch;
use crate::error::{Result, StoreError};
use crate::schema::LedgerDocument;
use crate::Store;

/// Default limit for a fresh read from disk.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default limit for a complete save cycle.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for [`JsonFileStore`].
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    /// Limit for reading the document from disk.
    pub read_timeout: Duration,
    /// Limit for backup, write and verify together.
    pub write_timeout: Duration,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Cache {
    /// Mirror of the file, `None` after a failed write.
    current: Option<Arc<LedgerDocument>>,
    /// Last document known to be good, kept for degraded reads.
    last_known: Option<Arc<LedgerDocument>>,
}

/// Flat-file backed storage implementation.
pub struct JsonFileStore {
    path: PathBuf,
    backup_path: PathBuf,
    temp_path: PathBuf,
    options: FileStoreOptions,
    cache: RwLock<Cache>,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open or create a ledger file at the given path.
    ///
    /// A missing file is created with an empty document. A corrupt file is
    /// restored from its backup, or replaced by an empty document if the
    /// backup is unusable too.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the file
    /// cannot be read or initialized.
    pub async fn open<P: AsRef<Path>>(path: P, options: FileStoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let store = Self {
            backup_path: sibling(&path, "backup"),
            temp_path: sibling(&path, "tmp"),
            path,
            options,
            cache: RwLock::new(Cache::default()),
            write_lock: Mutex::new(()),
        };

        if fs::try_exists(&store.path).await? {
            let doc = store.load_from_disk().await?;
            store.install(Arc::new(doc)).await;
        } else {
            let doc = LedgerDocument::default();
            store.persist(&doc).await?;
            store.install(Arc::new(doc)).await;
            tracing::info!(path = %store.path.display(), "Initialized empty ledger file");
        }

        Ok(store)
    }

    /// Path of the primary ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the backup mirror.
    #[must_use]
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Get the current document for reading.
    ///
    /// Served from cache when possible. If the cache was invalidated and the
    /// disk read times out, the last known document is returned instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk read fails and no fallback is available.
    pub async fn snapshot(&self) -> Result<Arc<LedgerDocument>> {
        if let Some(doc) = self.cache.read().await.current.clone() {
            return Ok(doc);
        }

        match tokio::time::timeout(self.options.read_timeout, self.load_from_disk()).await {
            Ok(Ok(doc)) => {
                let doc = Arc::new(doc);
                self.install(doc.clone()).await;
                Ok(doc)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let stale = self.cache.read().await.last_known.clone();
                match stale {
                    Some(doc) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            timeout_secs = %self.options.read_timeout.as_secs(),
                            "Ledger read timed out, serving last known document (degraded)"
                        );
                        Ok(doc)
                    }
                    None => Err(StoreError::Timeout {
                        operation: "ledger read",
                        seconds: self.options.read_timeout.as_secs(),
                    }),
                }
            }
        }
    }

    /// Get the current document as the base for a write. Never stale.
    async fn fresh_for_write(&self) -> Result<Arc<LedgerDocument>> {
        if let Some(doc) = self.cache.read().await.current.clone() {
            return Ok(doc);
        }
        let doc = tokio::time::timeout(self.options.read_timeout, self.load_from_disk())
            .await
            .map_err(|_| StoreError::Timeout {
                operation: "ledger read",
                seconds: self.options.read_timeout.as_secs(),
            })??;
        Ok(Arc::new(doc))
    }

    async fn install(&self, doc: Arc<LedgerDocument>) {
        let mut cache = self.cache.write().await;
        cache.last_known = Some(doc.clone());
        cache.current = Some(doc);
    }

    async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        if let Some(doc) = cache.current.take() {
            cache.last_known = Some(doc);
        }
    }

    /// Read and parse the primary file, falling back to the backup.
    async fn load_from_disk(&self) -> Result<LedgerDocument> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "Ledger file missing, trying backup");
                return Ok(self.recover_from_backup().await);
            }
            Err(e) => return Err(e.into()),
        };

        match parse_document(&bytes) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "Ledger file is corrupt, restoring from backup"
                );
                Ok(self.recover_from_backup().await)
            }
        }
    }

    /// Restore the primary file from the backup.
    ///
    /// Degrades to an empty document if the backup is missing or corrupt.
    async fn recover_from_backup(&self) -> LedgerDocument {
        let restored = match fs::read(&self.backup_path).await {
            Ok(bytes) => parse_document(&bytes),
            Err(e) => Err(StoreError::Io(e)),
        };

        match restored {
            Ok(doc) => {
                if let Err(e) = fs::copy(&self.backup_path, &self.path).await {
                    tracing::error!(error = %e, "Failed to copy backup over corrupt ledger file");
                } else {
                    tracing::info!(
                        backup = %self.backup_path.display(),
                        accounts = %doc.accounts.len(),
                        "Ledger restored from backup"
                    );
                }
                doc
            }
            Err(e) => {
                tracing::error!(
                    backup = %self.backup_path.display(),
                    error = %e,
                    "Backup unusable, continuing with an empty ledger"
                );
                LedgerDocument::default()
            }
        }
    }

    /// Backup, write, verify. Restores the backup on failure.
    async fn persist(&self, doc: &LedgerDocument) -> Result<()> {
        doc.validate().map_err(StoreError::Corruption)?;
        let bytes =
            serde_json::to_vec_pretty(doc).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let had_original = fs::try_exists(&self.path).await?;
        if had_original {
            fs::copy(&self.path, &self.backup_path).await?;
        }

        if let Err(e) = self.write_and_verify(&bytes).await {
            tracing::error!(path = %self.path.display(), error = %e, "Ledger write failed, restoring backup");
            if had_original {
                self.restore_backup().await;
            }
            return Err(e);
        }

        Ok(())
    }

    async fn write_and_verify(&self, bytes: &[u8]) -> Result<()> {
        fs::write(&self.temp_path, bytes).await?;
        fs::rename(&self.temp_path, &self.path).await?;

        let written = fs::read(&self.path).await?;
        let parsed = parse_document(&written)?;
        parsed.validate().map_err(StoreError::Corruption)?;
        Ok(())
    }

    /// Put the backup back in place, but only if it parses. An interrupted
    /// backup copy must never overwrite a good primary file.
    async fn restore_backup(&self) {
        let bytes = match fs::read(&self.backup_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read ledger backup, primary left as is");
                return;
            }
        };
        if let Err(e) = parse_document(&bytes) {
            tracing::error!(error = %e, "Ledger backup is not usable, primary left as is");
            return;
        }
        if let Err(e) = fs::write(&self.path, &bytes).await {
            tracing::error!(error = %e, "Failed to restore ledger from backup");
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn parse_document(bytes: &[u8]) -> Result<LedgerDocument> {
    let doc: LedgerDocument =
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
    doc.validate().map_err(StoreError::Corruption)?;
    Ok(doc)
}

#[async_trait]
impl Store for JsonFileStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn get_account(&self, user_id: UserId) -> Result<Option<Account>> {
        Ok(self.snapshot().await?.accounts.get(&user_id).cloned())
    }

    // =========================================================================
    // Reservation Operations
    // =========================================================================

    async fn get_reservation(&self, task_id: &TaskId) -> Result<Option<Reservation>> {
        Ok(self.snapshot().await?.reservations.get(task_id).cloned())
    }

    async fn list_reservations(&self, status: ReservationStatus) -> Result<Vec<Reservation>> {
        Ok(self
            .snapshot()
            .await?
            .reservations
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn get_charge(&self, task_id: &TaskId) -> Result<Option<ChargeRecord>> {
        Ok(self.snapshot().await?.charges.get(task_id).cloned())
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    async fn get_job(&self, task_id: &TaskId) -> Result<Option<Job>> {
        Ok(self.snapshot().await?.jobs.get(task_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.snapshot().await?.jobs.values().cloned().collect())
    }

    // =========================================================================
    // Free Usage Operations
    // =========================================================================

    async fn list_free_usage(
        &self,
        user_id: UserId,
        model_id: &str,
    ) -> Result<Vec<FreeUsageRecord>> {
        Ok(self
            .snapshot()
            .await?
            .free_usage
            .iter()
            .filter(|r| r.user_id == user_id && r.model_id == model_id)
            .cloned()
            .collect())
    }

    // =========================================================================
    // Referral Operations
    // =========================================================================

    async fn get_referrer(&self, user_id: UserId) -> Result<Option<UserId>> {
        Ok(self.snapshot().await?.referrals.get(&user_id).copied())
    }

    async fn list_referrals(&self, referrer_id: UserId) -> Result<Vec<UserId>> {
        Ok(self
            .snapshot()
            .await?
            .referrals
            .iter()
            .filter(|(_, referrer)| **referrer == referrer_id)
            .map(|(user, _)| *user)
            .collect())
    }

    async fn get_referral_bonus(&self, user_id: UserId) -> Result<u32> {
        Ok(self
            .snapshot()
            .await?
            .referral_bonuses
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    // =========================================================================
    // Event Operations
    // =========================================================================

    async fn has_processed_event(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .snapshot()
            .await?
            .processed_events
            .contains_key(event_id))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn apply(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let base = self.fresh_for_write().await?;
        let mut doc = (*base).clone();
        doc.apply(batch);

        match tokio::time::timeout(self.options.write_timeout, self.persist(&doc)).await {
            Ok(Ok(())) => {
                self.install(Arc::new(doc)).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.invalidate().await;
                Err(e)
            }
            Err(_) => {
                tracing::error!(
                    path = %self.path.display(),
                    timeout_secs = %self.options.write_timeout.as_secs(),
                    "Ledger write timed out, restoring backup"
                );
                self.restore_backup().await;
                self.invalidate().await;
                Err(StoreError::Timeout {
                    operation: "ledger write",
                    seconds: self.options.write_timeout.as_secs(),
                })
            }
        }
    }
}
