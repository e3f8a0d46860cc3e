//! The assembled engine and the flows that span components.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use genpay_client::{CreateTaskRequest, TaskApi, TaskState};
use genpay_core::{
    ChatId, HoldOutcome, JobStatus, LimitDecision, NewJob, ReservationStatus, SettleOutcome,
    TaskId, UserId,
};
use genpay_store::Store;

use crate::config::EngineConfig;
use crate::delivery::DeliveryLock;
use crate::error::Result;
use crate::events::EventLog;
use crate::jobs::JobTable;
use crate::ledger::Ledger;
use crate::limiter::FreeUsageLimiter;
use crate::locks::Locks;
use crate::orchestrator::{GenerationOutcome, Orchestrator, Progress};
use crate::referrals::Referrals;
use crate::reservations::ReservationManager;
use crate::retry::RetryPolicy;
use crate::settlement::SettlementAction;

/// Release reason for jobs that never reached a terminal state.
pub const STALE_JOB_REASON: &str = "stale_job";

/// Release reason for a failure reported by callback.
pub const CALLBACK_FAIL_REASON: &str = "remote_fail";

// ============================================================================
// Paid generation
// ============================================================================

/// Input of [`Engine::run_paid_generation`].
#[derive(Debug, Clone, PartialEq)]
pub struct PaidGenerationRequest {
    /// Caller-chosen key for the reservation and the job.
    pub task_id: TaskId,
    /// Who pays.
    pub user_id: UserId,
    /// Where the result goes.
    pub chat_id: Option<ChatId>,
    /// Remote model identifier.
    pub model_id: String,
    /// Opaque model input.
    pub input: serde_json::Value,
    /// Amount to hold.
    pub price: Decimal,
}

/// What happened to the held funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Funds {
    /// The hold was committed; the user paid.
    Retained,
    /// The hold was released; the user got the money back.
    Returned,
    /// No hold was placed by this call.
    NotHeld,
}

/// Result of [`Engine::run_paid_generation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidGenerationOutcome {
    /// The task.
    pub task_id: TaskId,
    /// Result of the hold.
    pub hold: HoldOutcome,
    /// Generation result, absent when nothing was held.
    pub generation: Option<GenerationOutcome>,
    /// Fate of the funds.
    pub funds: Funds,
}

// ============================================================================
// Free generation
// ============================================================================

/// Input of [`Engine::run_free_generation`].
#[derive(Debug, Clone, PartialEq)]
pub struct FreeGenerationRequest {
    /// Caller-chosen key for the job and the usage record.
    pub task_id: TaskId,
    /// Who asks.
    pub user_id: UserId,
    /// Where the result goes.
    pub chat_id: Option<ChatId>,
    /// Remote model identifier; must be a free model.
    pub model_id: String,
    /// Opaque model input.
    pub input: serde_json::Value,
}

/// What happened to the free-usage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSlot {
    /// The generation succeeded and the slot counts against the limits.
    Kept,
    /// The generation failed and the slot was given back.
    Returned,
    /// The limiter refused; no slot was taken.
    NotTaken,
}

/// Result of [`Engine::run_free_generation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeGenerationOutcome {
    /// The task.
    pub task_id: TaskId,
    /// Limiter decision, counts included.
    pub limits: LimitDecision,
    /// Generation result, absent when the limiter refused.
    pub generation: Option<GenerationOutcome>,
    /// Fate of the slot.
    pub slot: FreeSlot,
}

// ============================================================================
// Callbacks and maintenance
// ============================================================================

/// Result of [`Engine::handle_task_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// No live job matches the remote task.
    Orphan,
    /// The job is still running.
    Progress,
    /// The job succeeded; the hold was committed (or had been settled).
    Completed(SettleOutcome),
    /// The job failed; the hold was released (or had been settled).
    Failed(SettleOutcome),
}

/// Counts from one [`Engine::run_maintenance`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    /// Holds released for age.
    pub expired_reservations: usize,
    /// Jobs failed for age.
    pub stale_jobs: usize,
    /// Idle lock entries dropped.
    pub pruned_locks: usize,
    /// Steps that failed.
    pub failed_steps: usize,
}

/// All engine components over one store and one set of locks.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    locks: Arc<Locks>,
    config: EngineConfig,
    ledger: Ledger,
    reservations: ReservationManager,
    jobs: JobTable,
    delivery: DeliveryLock,
    limiter: FreeUsageLimiter,
    referrals: Referrals,
    events: EventLog,
    orchestrator: Orchestrator,
}

impl Engine {
    /// Assemble an engine.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, api: Arc<dyn TaskApi>, config: EngineConfig) -> Self {
        let locks = Arc::new(Locks::new());
        let retention = &config.retention;

        Self {
            ledger: Ledger::new(Arc::clone(&store), Arc::clone(&locks)),
            reservations: ReservationManager::new(Arc::clone(&store), Arc::clone(&locks)),
            jobs: JobTable::new(Arc::clone(&store), Arc::clone(&locks), retention),
            delivery: DeliveryLock::new(
                Arc::clone(&store),
                Arc::clone(&locks),
                config.generation.delivery_lock_timeout_minutes,
            )
            .with_send_retry(RetryPolicy::with_attempts(config.generation.send_attempts)),
            limiter: FreeUsageLimiter::new(
                Arc::clone(&store),
                Arc::clone(&locks),
                config.free_tier.clone(),
                retention,
            ),
            referrals: Referrals::new(
                Arc::clone(&store),
                Arc::clone(&locks),
                config.free_tier.clone(),
            ),
            events: EventLog::new(Arc::clone(&store), retention.processed_event_ttl),
            orchestrator: Orchestrator::new(api, config.generation.clone()),
            store,
            locks,
            config,
        }
    }

    /// Replace the retry policy used for settlements.
    #[must_use]
    pub fn with_settle_retry(mut self, policy: RetryPolicy) -> Self {
        self.reservations = self.reservations.with_settle_retry(policy);
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Balance ledger.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Reservation manager.
    #[must_use]
    pub fn reservations(&self) -> &ReservationManager {
        &self.reservations
    }

    /// Job table.
    #[must_use]
    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Delivery lock.
    #[must_use]
    pub fn delivery(&self) -> &DeliveryLock {
        &self.delivery
    }

    /// Free-usage limiter.
    #[must_use]
    pub fn limiter(&self) -> &FreeUsageLimiter {
        &self.limiter
    }

    /// Referral registry.
    #[must_use]
    pub fn referrals(&self) -> &Referrals {
        &self.referrals
    }

    /// Remote generation orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Hold, generate, and settle one paid task.
    ///
    /// Funds are committed on success and released on failure or timeout.
    /// When the hold is refused nothing else happens.
    ///
    /// # Errors
    ///
    /// Returns a store error if the hold or the job record cannot be written,
    /// or [`EngineError::SettlementFailed`](crate::EngineError::SettlementFailed)
    /// if the final commit or release could not be made durable.
    pub async fn run_paid_generation(
        &self,
        request: PaidGenerationRequest,
        heartbeat: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<PaidGenerationOutcome> {
        let task_id = request.task_id.clone();
        let metadata = serde_json::json!({
            "chat_id": request.chat_id.map(|c| c.get()),
        });

        let hold = self
            .reservations
            .hold(
                &task_id,
                request.user_id,
                request.price,
                &request.model_id,
                metadata,
            )
            .await?;

        if !matches!(hold, HoldOutcome::Held) {
            tracing::info!(task_id = %task_id, hold = ?hold, "Paid generation not started");
            return Ok(PaidGenerationOutcome {
                task_id,
                hold,
                generation: None,
                funds: Funds::NotHeld,
            });
        }

        self.jobs
            .create_job(NewJob {
                task_id: task_id.clone(),
                user_id: request.user_id,
                chat_id: request.chat_id,
                model_id: request.model_id.clone(),
                params: request.input.clone(),
                price: request.price,
            })
            .await?;

        let outcome = self
            .generate(&task_id, request.model_id, request.input, heartbeat)
            .await;

        let action = outcome.settlement();
        let reason = outcome
            .error_code
            .as_deref()
            .unwrap_or("generation_failed")
            .to_ascii_lowercase();
        let settled = self
            .reservations
            .settle_with_retry(&task_id, action, &reason)
            .await;

        self.record_result(&task_id, &outcome).await;

        let funds = funds_after(action, settled?);
        tracing::info!(
            task_id = %task_id,
            state = %outcome.state.as_str(),
            funds = ?funds,
            elapsed_ms = %outcome.elapsed.as_millis(),
            "Paid generation finished"
        );

        Ok(PaidGenerationOutcome {
            task_id,
            hold,
            generation: Some(outcome),
            funds,
        })
    }

    /// Reserve a free slot, generate, and give the slot back on failure.
    ///
    /// The slot is taken atomically before anything reaches the remote API.
    /// A failed or timed out generation does not count against the user's
    /// limits.
    ///
    /// # Errors
    ///
    /// Returns a store error if the slot or the job record cannot be written.
    pub async fn run_free_generation(
        &self,
        request: FreeGenerationRequest,
        heartbeat: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<FreeGenerationOutcome> {
        let task_id = request.task_id.clone();
        let user_id = request.user_id;

        let limits = self
            .limiter
            .check_limits_and_reserve(user_id, &request.model_id, Some(task_id.as_str()))
            .await?;
        if !limits.allowed {
            tracing::info!(
                task_id = %task_id,
                user_id = %user_id,
                reason = %limits.reason.as_str(),
                "Free generation not started"
            );
            return Ok(FreeGenerationOutcome {
                task_id,
                limits,
                generation: None,
                slot: FreeSlot::NotTaken,
            });
        }

        self.jobs
            .create_job(NewJob {
                task_id: task_id.clone(),
                user_id,
                chat_id: request.chat_id,
                model_id: request.model_id.clone(),
                params: request.input.clone(),
                price: Decimal::ZERO,
            })
            .await?;

        let outcome = self
            .generate(&task_id, request.model_id.clone(), request.input, heartbeat)
            .await;
        self.record_result(&task_id, &outcome).await;

        let slot = if outcome.is_success() {
            FreeSlot::Kept
        } else {
            match self
                .limiter
                .delete_usage(user_id, &request.model_id, Some(task_id.as_str()))
                .await
            {
                Ok(true) => FreeSlot::Returned,
                Ok(false) => FreeSlot::Kept,
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to return free slot");
                    FreeSlot::Kept
                }
            }
        };

        tracing::info!(
            task_id = %task_id,
            state = %outcome.state.as_str(),
            slot = ?slot,
            elapsed_ms = %outcome.elapsed.as_millis(),
            "Free generation finished"
        );

        Ok(FreeGenerationOutcome {
            task_id,
            limits,
            generation: Some(outcome),
            slot,
        })
    }

    /// Apply a completion notification from the remote API.
    ///
    /// Races the poller safely: whichever settles first wins and the other
    /// sees `AlreadySettled`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the job cannot be read or updated, or a
    /// settlement error if the commit or release could not be made durable.
    pub async fn handle_task_callback(
        &self,
        remote_task_id: &str,
        state: TaskState,
        result_urls: Vec<String>,
        error: Option<String>,
    ) -> Result<CallbackOutcome> {
        let job = match self.jobs.find_by_remote_task(remote_task_id).await? {
            Some(job) if !job.status.is_terminal() => job,
            Some(job) => {
                tracing::info!(
                    remote_task_id = %remote_task_id,
                    task_id = %job.task_id,
                    status = %job.status.as_str(),
                    "Callback for finished job ignored"
                );
                return Ok(CallbackOutcome::Orphan);
            }
            None => {
                tracing::info!(remote_task_id = %remote_task_id, "Callback for unknown task ignored");
                return Ok(CallbackOutcome::Orphan);
            }
        };
        let task_id = job.task_id;

        match state {
            TaskState::Waiting => {
                self.jobs
                    .update_job_status(&task_id, JobStatus::Running, None, None)
                    .await?;
                Ok(CallbackOutcome::Progress)
            }
            TaskState::Success => {
                self.jobs
                    .update_job_status(&task_id, JobStatus::Done, Some(result_urls), None)
                    .await?;
                let settled = self.reservations.commit_with_retry(&task_id).await?;
                tracing::info!(task_id = %task_id, remote_task_id = %remote_task_id, "Callback completed job");
                Ok(CallbackOutcome::Completed(settled))
            }
            TaskState::Fail => {
                self.jobs
                    .update_job_status(&task_id, JobStatus::Failed, None, error)
                    .await?;
                let settled = self
                    .reservations
                    .release_with_retry(&task_id, CALLBACK_FAIL_REASON)
                    .await?;
                tracing::info!(task_id = %task_id, remote_task_id = %remote_task_id, "Callback failed job");
                Ok(CallbackOutcome::Failed(settled))
            }
        }
    }

    /// Fail non-terminal jobs older than `stale_after` and release their
    /// holds. Returns how many jobs were failed.
    ///
    /// # Errors
    ///
    /// Returns a store error if the jobs cannot be listed. Per-job failures
    /// are logged and skipped.
    pub async fn cleanup_stale_jobs(&self, stale_after: Duration) -> Result<usize> {
        let mut cleaned = 0;
        for job in self.jobs.list_stale(stale_after).await? {
            let task_id = job.task_id;
            match self
                .jobs
                .update_job_status(
                    &task_id,
                    JobStatus::Failed,
                    None,
                    Some("job did not finish in time".into()),
                )
                .await
            {
                Ok(true) => cleaned += 1,
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to mark stale job");
                    continue;
                }
            }
            if let Err(e) = self
                .reservations
                .release_with_retry(&task_id, STALE_JOB_REASON)
                .await
            {
                tracing::error!(task_id = %task_id, error = %e, "Failed to release stale job hold");
            }
        }

        if cleaned > 0 {
            tracing::info!(cleaned = %cleaned, "Stale jobs failed");
        }
        Ok(cleaned)
    }

    /// One pass of periodic upkeep. Failing steps are logged and counted.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let retention = &self.config.retention;
        let mut report = MaintenanceReport::default();

        if let Err(e) = self.jobs.prune().await {
            tracing::error!(error = %e, "Job pruning failed");
            report.failed_steps += 1;
        }

        match self.reservations.expire_stale(retention.reservation_ttl).await {
            Ok(n) => report.expired_reservations = n,
            Err(e) => {
                tracing::error!(error = %e, "Reservation expiry failed");
                report.failed_steps += 1;
            }
        }

        match self.cleanup_stale_jobs(retention.stale_job_after).await {
            Ok(n) => report.stale_jobs = n,
            Err(e) => {
                tracing::error!(error = %e, "Stale job cleanup failed");
                report.failed_steps += 1;
            }
        }

        report.pruned_locks = self.locks.prune() + self.events.prune_locks();

        tracing::debug!(
            expired_reservations = %report.expired_reservations,
            stale_jobs = %report.stale_jobs,
            pruned_locks = %report.pruned_locks,
            failed_steps = %report.failed_steps,
            "Maintenance pass finished"
        );
        report
    }

    /// Create the remote task, link it to the job and wait for the outcome.
    async fn generate(
        &self,
        task_id: &TaskId,
        model_id: String,
        input: serde_json::Value,
        heartbeat: &mut (dyn FnMut(Progress) + Send),
    ) -> GenerationOutcome {
        let mut create = CreateTaskRequest::new(model_id, input);
        if let Some(url) = &self.config.generation.callback_url {
            create = create.with_callback(url.clone());
        }

        match self.orchestrator.create(&create).await {
            Ok(remote_task_id) => {
                if let Err(e) = self.jobs.set_remote_task_id(task_id, &remote_task_id).await {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to link remote task");
                }
                self.orchestrator.wait(&remote_task_id, heartbeat).await
            }
            Err(outcome) => outcome,
        }
    }

    /// Write the generation result to the job. Failures are logged.
    async fn record_result(&self, task_id: &TaskId, outcome: &GenerationOutcome) {
        let (status, urls) = if outcome.is_success() {
            (JobStatus::Done, Some(outcome.result_urls.clone()))
        } else {
            (JobStatus::Failed, None)
        };
        if let Err(e) = self
            .jobs
            .update_job_status(task_id, status, urls, outcome.error_message.clone())
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "Failed to record job result");
        }
    }

    /// Claim an inbound event. Returns `true` for exactly one caller per id.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn mark_event_processed(&self, event_id: &str) -> Result<bool> {
        self.events.mark_event_processed(event_id).await
    }
}

fn funds_after(action: SettlementAction, settled: SettleOutcome) -> Funds {
    match settled {
        SettleOutcome::AlreadySettled(ReservationStatus::Committed) => Funds::Retained,
        SettleOutcome::AlreadySettled(ReservationStatus::Released) => Funds::Returned,
        SettleOutcome::NotFound => Funds::NotHeld,
        SettleOutcome::Settled | SettleOutcome::AlreadySettled(ReservationStatus::Pending) => {
            match action {
                SettlementAction::Commit => Funds::Retained,
                SettlementAction::Release => Funds::Returned,
            }
        }
    }
}
