//! Delivery lock and charge-after-delivery.
//!
//! A job is handed to at most one deliverer at a time by stamping
//! `delivering_at`. The stamp goes stale after a timeout, so a crashed
//! delivery can be retried without explicit crash detection. Marking a job
//! delivered pays for it at most once: the payment and the
//! `balance_charged_after_delivery` flag are written in one batch together
//! with the task's [`ChargeRecord`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use genpay_core::{
    normalize_result_urls, validate_result_url, Account, ChargeRecord, ChargeSource, Job,
    JobStatus, ReservationStatus, TaskId,
};
use genpay_store::{Batch, Mutation, Store};

use crate::error::Result;
use crate::locks::Locks;
use crate::retry::RetryPolicy;

/// Lock timeout used when a caller passes a non-positive one.
pub const DEFAULT_LOCK_TIMEOUT_MINUTES: i64 = 5;

/// Error returned by a [`ResultSender`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SendError(pub String);

/// Sends finished results to the user.
#[async_trait]
pub trait ResultSender: Send + Sync {
    /// Send `urls` for `job`.
    ///
    /// # Errors
    ///
    /// Returns an error if the result could not be sent.
    async fn send(&self, job: &Job, urls: &[String]) -> std::result::Result<(), SendError>;
}

/// What marking a job delivered did to the user's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// A pending hold for the task was committed.
    CommittedHold {
        /// Held amount now spent.
        amount: Decimal,
    },
    /// The job price was subtracted.
    Charged {
        /// Amount subtracted.
        amount: Decimal,
    },
    /// The task was already paid for; nothing changed.
    AlreadyCharged,
    /// The job is free; the flag was set without a charge.
    Free,
    /// The balance did not cover the price; the flag stays unset.
    InsufficientFunds {
        /// Balance at the time.
        balance: Decimal,
        /// Price that could not be taken.
        required: Decimal,
    },
    /// Delivery failed, so nothing was charged.
    NotCharged,
    /// No such job.
    NotFound,
}

/// Summary of one [`DeliveryLock::deliver_result`] call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    /// The result reached the user in this call.
    pub delivered: bool,
    /// The job had been delivered before this call.
    pub already_delivered: bool,
    /// This call held the delivery lock.
    pub lock_acquired: bool,
    /// Effect on the balance, when the job was marked.
    pub charge: Option<ChargeOutcome>,
    /// Why delivery failed, if it did.
    pub error: Option<String>,
}

/// Per-job delivery lock with charge-after-delivery.
#[derive(Clone)]
pub struct DeliveryLock {
    store: Arc<dyn Store>,
    locks: Arc<Locks>,
    lock_timeout_minutes: i64,
    send_retry: RetryPolicy,
}

impl DeliveryLock {
    /// Create a delivery lock over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, locks: Arc<Locks>, lock_timeout_minutes: i64) -> Self {
        Self {
            store,
            locks,
            lock_timeout_minutes,
            send_retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy used when sending results.
    #[must_use]
    pub fn with_send_retry(mut self, policy: RetryPolicy) -> Self {
        self.send_retry = policy;
        self
    }

    /// Take exclusive delivery rights for a job.
    ///
    /// Returns `None` if the job is unknown, delivered, or locked less than
    /// `timeout_minutes` ago. A non-positive timeout falls back to
    /// [`DEFAULT_LOCK_TIMEOUT_MINUTES`].
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn try_acquire_delivery_lock(
        &self,
        task_id: &TaskId,
        timeout_minutes: i64,
    ) -> Result<Option<Job>> {
        let minutes = if timeout_minutes > 0 {
            timeout_minutes
        } else {
            tracing::warn!(
                task_id = %task_id,
                timeout_minutes = %timeout_minutes,
                "Non-positive delivery lock timeout, using default"
            );
            DEFAULT_LOCK_TIMEOUT_MINUTES
        };
        self.try_acquire_delivery_lock_for(task_id, chrono::Duration::minutes(minutes))
            .await
    }

    /// Take exclusive delivery rights for a job, with the timeout as a
    /// duration.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn try_acquire_delivery_lock_for(
        &self,
        task_id: &TaskId,
        timeout: chrono::Duration,
    ) -> Result<Option<Job>> {
        let timeout = if timeout > chrono::Duration::zero() {
            timeout
        } else {
            tracing::warn!(task_id = %task_id, "Non-positive delivery lock timeout, using default");
            chrono::Duration::minutes(DEFAULT_LOCK_TIMEOUT_MINUTES)
        };

        let _task = self.locks.tasks.lock(task_id).await;
        let Some(mut job) = self.store.get_job(task_id).await? else {
            tracing::debug!(task_id = %task_id, "Delivery lock refused, unknown job");
            return Ok(None);
        };
        if job.is_delivered() {
            tracing::debug!(task_id = %task_id, "Delivery lock refused, already delivered");
            return Ok(None);
        }

        let now = Utc::now();
        if job.has_fresh_delivery_lock(now, timeout) {
            tracing::debug!(task_id = %task_id, "Delivery lock refused, held elsewhere");
            return Ok(None);
        }
        if job.delivering_at.is_some() {
            tracing::warn!(task_id = %task_id, "Reclaiming stale delivery lock");
        }

        job.delivering_at = Some(now);
        job.touch();
        self.store
            .apply(Batch::from(Mutation::PutJob(job.clone())))
            .await?;

        tracing::debug!(task_id = %task_id, "Delivery lock acquired");
        Ok(Some(job))
    }

    /// Record the end of a delivery attempt.
    ///
    /// On success the job is stamped delivered and, unless it was paid for
    /// already, paid for now: a pending hold is committed, a committed hold
    /// counts as paid, and otherwise the job price is subtracted if the
    /// balance covers it. On failure the lock is cleared and the error
    /// appended to the job; nothing is charged.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn mark_delivered(
        &self,
        task_id: &TaskId,
        success: bool,
        error: Option<&str>,
    ) -> Result<ChargeOutcome> {
        let _task = self.locks.tasks.lock(task_id).await;
        let Some(mut job) = self.store.get_job(task_id).await? else {
            tracing::warn!(task_id = %task_id, "mark_delivered for unknown job");
            return Ok(ChargeOutcome::NotFound);
        };

        job.delivering_at = None;
        job.touch();

        if !success {
            let error = error.unwrap_or("unknown error");
            job.append_delivery_failure(error);
            self.store.apply(Batch::from(Mutation::PutJob(job))).await?;
            tracing::warn!(task_id = %task_id, error = %error, "Delivery failed");
            return Ok(ChargeOutcome::NotCharged);
        }

        if job.delivered_at.is_none() {
            job.delivered_at = Some(Utc::now());
        }
        job.status = JobStatus::Done;

        if job.balance_charged_after_delivery {
            self.store.apply(Batch::from(Mutation::PutJob(job))).await?;
            return Ok(ChargeOutcome::AlreadyCharged);
        }

        let user_id = job.user_id;
        let _account = self.locks.accounts.lock(&user_id).await;
        let mut batch = Batch::new();

        let outcome = if self.store.get_charge(task_id).await?.is_some() {
            ChargeOutcome::AlreadyCharged
        } else {
            match self.store.get_reservation(task_id).await? {
                Some(mut reservation) if reservation.status == ReservationStatus::Pending => {
                    let amount = reservation.amount;
                    let mut account = self.load_account(user_id).await?;
                    account.record_spend(amount)?;
                    reservation.commit();
                    batch.push(Mutation::PutReservation(reservation));
                    batch.push(Mutation::PutAccount(account));
                    batch.push(Mutation::PutCharge(ChargeRecord::new(
                        task_id.clone(),
                        user_id,
                        amount,
                        ChargeSource::ReservationCommit,
                    )));
                    ChargeOutcome::CommittedHold { amount }
                }
                Some(reservation) if reservation.status == ReservationStatus::Committed => {
                    ChargeOutcome::AlreadyCharged
                }
                _ if job.price.is_zero() => ChargeOutcome::Free,
                _ => {
                    let price = job.price;
                    let mut account = self.load_account(user_id).await?;
                    if account.try_debit(price) {
                        account.record_spend(price)?;
                        batch.push(Mutation::PutAccount(account));
                        batch.push(Mutation::PutCharge(ChargeRecord::new(
                            task_id.clone(),
                            user_id,
                            price,
                            ChargeSource::DeliveryCharge,
                        )));
                        ChargeOutcome::Charged { amount: price }
                    } else {
                        tracing::error!(
                            task_id = %task_id,
                            user_id = %user_id,
                            balance = %account.balance,
                            price = %price,
                            "Delivered but balance does not cover the price"
                        );
                        ChargeOutcome::InsufficientFunds {
                            balance: account.balance,
                            required: price,
                        }
                    }
                }
            }
        };

        if !matches!(outcome, ChargeOutcome::InsufficientFunds { .. }) {
            job.balance_charged_after_delivery = true;
        }
        batch.push(Mutation::PutJob(job));
        self.store.apply(batch).await?;

        tracing::info!(task_id = %task_id, user_id = %user_id, charge = ?outcome, "Job delivered");
        Ok(outcome)
    }

    /// Lock, validate, send and mark a job in one call.
    ///
    /// # Errors
    ///
    /// Returns a store error if locking or marking fails. Send failures are
    /// reported in the [`DeliveryReport`].
    pub async fn deliver_result(
        &self,
        task_id: &TaskId,
        sender: &dyn ResultSender,
    ) -> Result<DeliveryReport> {
        let Some(job) = self
            .try_acquire_delivery_lock(task_id, self.lock_timeout_minutes)
            .await?
        else {
            let already_delivered = self
                .store
                .get_job(task_id)
                .await?
                .is_some_and(|job| job.is_delivered());
            return Ok(DeliveryReport {
                already_delivered,
                ..DeliveryReport::default()
            });
        };

        let urls = normalize_result_urls(&job.result_urls);
        let invalid = if urls.is_empty() {
            Some("no result urls".to_string())
        } else {
            urls.iter()
                .find_map(|url| validate_result_url(url).err())
                .map(|e| e.to_string())
        };
        if let Some(error) = invalid {
            let charge = self.mark_delivered(task_id, false, Some(&error)).await?;
            return Ok(DeliveryReport {
                lock_acquired: true,
                charge: Some(charge),
                error: Some(error),
                ..DeliveryReport::default()
            });
        }

        let sent = self
            .send_retry
            .run("send_result", || sender.send(&job, &urls), |_| true)
            .await;

        match sent {
            Ok(()) => {
                let charge = self.mark_delivered(task_id, true, None).await?;
                Ok(DeliveryReport {
                    delivered: true,
                    lock_acquired: true,
                    charge: Some(charge),
                    ..DeliveryReport::default()
                })
            }
            Err(exhausted) => {
                let error = exhausted.error.to_string();
                let charge = self.mark_delivered(task_id, false, Some(&error)).await?;
                Ok(DeliveryReport {
                    lock_acquired: true,
                    charge: Some(charge),
                    error: Some(error),
                    ..DeliveryReport::default()
                })
            }
        }
    }

    async fn load_account(&self, user_id: genpay_core::UserId) -> Result<Account> {
        Ok(self
            .store
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| Account::new(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use genpay_core::{NewJob, UserId};
    use genpay_store::{FileStoreOptions, JsonFileStore};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    use crate::reservations::ReservationManager;

    struct Fixture {
        delivery: DeliveryLock,
        reservations: ReservationManager,
        store: Arc<dyn Store>,
        _dir: TempDir,
    }

    async fn create_test_fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(
            JsonFileStore::open(dir.path().join("ledger.json"), FileStoreOptions::default())
                .await
                .unwrap(),
        );
        let locks = Arc::new(Locks::new());
        Fixture {
            delivery: DeliveryLock::new(Arc::clone(&store), Arc::clone(&locks), 5).with_send_retry(
                RetryPolicy {
                    max_attempts: 2,
                    initial_backoff: std::time::Duration::from_millis(1),
                    max_backoff: std::time::Duration::from_millis(1),
                },
            ),
            reservations: ReservationManager::new(Arc::clone(&store), locks),
            store,
            _dir: dir,
        }
    }

    fn user() -> UserId {
        UserId::new(7).unwrap()
    }

    async fn seed(fixture: &Fixture, id: &str, price: Decimal, balance: Decimal, urls: &[&str]) {
        let mut job = Job::new(NewJob {
            task_id: TaskId::new(id).unwrap(),
            user_id: user(),
            chat_id: None,
            model_id: "z-image".into(),
            params: serde_json::Value::Null,
            price,
        });
        job.status = JobStatus::Done;
        job.result_urls = urls.iter().map(|u| (*u).to_string()).collect();
        let mut account = Account::new(user());
        account.balance = balance;
        fixture
            .store
            .apply(
                Batch::new()
                    .with(Mutation::PutJob(job))
                    .with(Mutation::PutAccount(account)),
            )
            .await
            .unwrap();
    }

    async fn balance(fixture: &Fixture) -> Decimal {
        fixture
            .store
            .get_account(user())
            .await
            .unwrap()
            .map_or(Decimal::ZERO, |a| a.balance)
    }

    struct CountingSender {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ResultSender for CountingSender {
        async fn send(&self, _job: &Job, _urls: &[String]) -> std::result::Result<(), SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SendError("chat unreachable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_stale() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t1").unwrap();
        seed(&fixture, "t1", dec!(1), dec!(5), &["https://cdn.example/a.png"]).await;

        assert!(fixture.delivery.try_acquire_delivery_lock(&task, 5).await.unwrap().is_some());
        assert!(fixture.delivery.try_acquire_delivery_lock(&task, 5).await.unwrap().is_none());

        // A zero-length timeout would treat every lock as stale; it falls back to the default.
        assert!(fixture.delivery.try_acquire_delivery_lock(&task, 0).await.unwrap().is_none());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let reclaimed = fixture
            .delivery
            .try_acquire_delivery_lock_for(&task, chrono::Duration::milliseconds(10))
            .await
            .unwrap();
        assert!(reclaimed.is_some());
    }

    #[tokio::test]
    async fn unknown_job_cannot_be_locked_or_marked() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("ghost").unwrap();
        assert!(fixture.delivery.try_acquire_delivery_lock(&task, 5).await.unwrap().is_none());
        assert_eq!(
            fixture.delivery.mark_delivered(&task, true, None).await.unwrap(),
            ChargeOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn second_mark_does_not_charge_again() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t2").unwrap();
        seed(&fixture, "t2", dec!(3), dec!(10), &["https://cdn.example/a.png"]).await;

        assert_eq!(
            fixture.delivery.mark_delivered(&task, true, None).await.unwrap(),
            ChargeOutcome::Charged { amount: dec!(3) }
        );
        assert_eq!(
            fixture.delivery.mark_delivered(&task, true, None).await.unwrap(),
            ChargeOutcome::AlreadyCharged
        );
        assert_eq!(balance(&fixture).await, dec!(7));

        let job = fixture.store.get_job(&task).await.unwrap().unwrap();
        assert!(job.is_delivered());
        assert!(job.balance_charged_after_delivery);
        assert!(job.delivering_at.is_none());
        assert!(fixture.delivery.try_acquire_delivery_lock(&task, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_hold_is_committed_not_charged_twice() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t3").unwrap();
        seed(&fixture, "t3", dec!(4), dec!(10), &["https://cdn.example/a.png"]).await;
        let held = fixture
            .reservations
            .hold(&task, user(), dec!(4), "z-image", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(held.is_held());
        assert_eq!(balance(&fixture).await, dec!(6));

        assert_eq!(
            fixture.delivery.mark_delivered(&task, true, None).await.unwrap(),
            ChargeOutcome::CommittedHold { amount: dec!(4) }
        );
        assert_eq!(balance(&fixture).await, dec!(6));

        let reservation = fixture.store.get_reservation(&task).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Committed);
        let charge = fixture.store.get_charge(&task).await.unwrap().unwrap();
        assert_eq!(charge.source, ChargeSource::ReservationCommit);
    }

    #[tokio::test]
    async fn committed_hold_counts_as_paid() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t4").unwrap();
        seed(&fixture, "t4", dec!(2), dec!(10), &["https://cdn.example/a.png"]).await;
        fixture
            .reservations
            .hold(&task, user(), dec!(2), "z-image", serde_json::Value::Null)
            .await
            .unwrap();
        fixture.reservations.commit(&task).await.unwrap();

        assert_eq!(
            fixture.delivery.mark_delivered(&task, true, None).await.unwrap(),
            ChargeOutcome::AlreadyCharged
        );
        assert_eq!(balance(&fixture).await, dec!(8));
    }

    #[tokio::test]
    async fn short_balance_leaves_flag_unset() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t5").unwrap();
        seed(&fixture, "t5", dec!(5), dec!(1), &["https://cdn.example/a.png"]).await;

        let outcome = fixture.delivery.mark_delivered(&task, true, None).await.unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::InsufficientFunds {
                balance: dec!(1),
                required: dec!(5)
            }
        );
        assert_eq!(balance(&fixture).await, dec!(1));

        let job = fixture.store.get_job(&task).await.unwrap().unwrap();
        assert!(job.is_delivered());
        assert!(!job.balance_charged_after_delivery);
        assert!(fixture.store.get_charge(&task).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn free_job_sets_flag_without_charge() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t6").unwrap();
        seed(&fixture, "t6", Decimal::ZERO, dec!(1), &["https://cdn.example/a.png"]).await;

        assert_eq!(
            fixture.delivery.mark_delivered(&task, true, None).await.unwrap(),
            ChargeOutcome::Free
        );
        let job = fixture.store.get_job(&task).await.unwrap().unwrap();
        assert!(job.balance_charged_after_delivery);
        assert!(fixture.store.get_charge(&task).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_mark_releases_lock_and_records_error() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t7").unwrap();
        seed(&fixture, "t7", dec!(1), dec!(5), &["https://cdn.example/a.png"]).await;

        assert!(fixture.delivery.try_acquire_delivery_lock(&task, 5).await.unwrap().is_some());
        assert_eq!(
            fixture
                .delivery
                .mark_delivered(&task, false, Some("blocked by user"))
                .await
                .unwrap(),
            ChargeOutcome::NotCharged
        );

        let job = fixture.store.get_job(&task).await.unwrap().unwrap();
        assert!(!job.is_delivered());
        assert!(job.delivering_at.is_none());
        assert!(job
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("blocked by user")));
        assert_eq!(balance(&fixture).await, dec!(5));
        assert!(fixture.delivery.try_acquire_delivery_lock(&task, 5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deliver_result_sends_once_and_charges() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t8").unwrap();
        seed(&fixture, "t8", dec!(2), dec!(5), &["https://cdn.example/a.png"]).await;
        let sender = CountingSender {
            calls: AtomicU32::new(0),
            fail: false,
        };

        let first = fixture.delivery.deliver_result(&task, &sender).await.unwrap();
        assert!(first.delivered);
        assert_eq!(first.charge, Some(ChargeOutcome::Charged { amount: dec!(2) }));

        let second = fixture.delivery.deliver_result(&task, &sender).await.unwrap();
        assert!(!second.delivered);
        assert!(second.already_delivered);
        assert!(!second.lock_acquired);

        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
        assert_eq!(balance(&fixture).await, dec!(3));
    }

    #[tokio::test]
    async fn deliver_result_reports_send_failure() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t9").unwrap();
        seed(&fixture, "t9", dec!(2), dec!(5), &["https://cdn.example/a.png"]).await;
        let sender = CountingSender {
            calls: AtomicU32::new(0),
            fail: true,
        };

        let report = fixture.delivery.deliver_result(&task, &sender).await.unwrap();
        assert!(!report.delivered);
        assert_eq!(report.charge, Some(ChargeOutcome::NotCharged));
        assert_eq!(report.error.as_deref(), Some("chat unreachable"));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 2);
        assert_eq!(balance(&fixture).await, dec!(5));
    }

    #[tokio::test]
    async fn deliver_result_rejects_bad_urls_without_sending() {
        let fixture = create_test_fixture().await;
        let task = TaskId::new("t10").unwrap();
        seed(&fixture, "t10", dec!(2), dec!(5), &["ftp://cdn.example/a.png"]).await;
        let sender = CountingSender {
            calls: AtomicU32::new(0),
            fail: false,
        };

        let report = fixture.delivery.deliver_result(&task, &sender).await.unwrap();
        assert!(!report.delivered);
        assert!(report.error.is_some());
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
    }
}
