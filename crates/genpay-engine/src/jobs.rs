//! Durable job table.
//!
//! Jobs survive restarts. Each insert prunes by TTL and cap in the same batch,
//! so the table stays bounded without a separate sweeper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use genpay_core::{normalize_result_urls, Job, JobStatus, NewJob, TaskId};
use genpay_store::{Batch, Mutation, Store};

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::locks::Locks;

/// Create, update and look up generation jobs.
#[derive(Clone)]
pub struct JobTable {
    store: Arc<dyn Store>,
    locks: Arc<Locks>,
    job_ttl: Duration,
    max_jobs: usize,
}

impl JobTable {
    /// Create a job table over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, locks: Arc<Locks>, retention: &RetentionConfig) -> Self {
        Self {
            store,
            locks,
            job_ttl: retention.job_ttl,
            max_jobs: retention.max_jobs,
        }
    }

    fn prune_mutation(&self) -> Mutation {
        Mutation::PruneJobs {
            created_before: Utc::now() - to_chrono(self.job_ttl),
            max_jobs: self.max_jobs,
        }
    }

    /// Record a new job, or return the existing one for the same task.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn create_job(&self, input: NewJob) -> Result<Job> {
        let task_id = input.task_id.clone();
        let _task = self.locks.tasks.lock(&task_id).await;

        if let Some(existing) = self.store.get_job(&task_id).await? {
            tracing::debug!(task_id = %task_id, "Job already exists");
            return Ok(existing);
        }

        let job = Job::new(input);
        self.store
            .apply(
                Batch::new()
                    .with(Mutation::PutJob(job.clone()))
                    .with(self.prune_mutation()),
            )
            .await?;

        tracing::info!(
            task_id = %task_id,
            user_id = %job.user_id,
            model_id = %job.model_id,
            "Job created"
        );
        Ok(job)
    }

    /// Get a job by task.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn get_job(&self, task_id: &TaskId) -> Result<Option<Job>> {
        Ok(self.store.get_job(task_id).await?)
    }

    /// Find the job the remote API knows as `remote_task_id`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn find_by_remote_task(&self, remote_task_id: &str) -> Result<Option<Job>> {
        Ok(self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .find(|job| job.remote_task_id.as_deref() == Some(remote_task_id)))
    }

    /// Remember the remote task id and move a queued job to `waiting`.
    ///
    /// Returns `false` if the job is unknown.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn set_remote_task_id(&self, task_id: &TaskId, remote_task_id: &str) -> Result<bool> {
        let _task = self.locks.tasks.lock(task_id).await;
        let Some(mut job) = self.store.get_job(task_id).await? else {
            return Ok(false);
        };

        job.remote_task_id = Some(remote_task_id.to_string());
        if job.status == JobStatus::Queued {
            job.status = JobStatus::Waiting;
        }
        job.touch();
        self.store.apply(Batch::from(Mutation::PutJob(job))).await?;

        tracing::debug!(task_id = %task_id, remote_task_id = %remote_task_id, "Remote task linked");
        Ok(true)
    }

    /// Move a job to `status`, optionally replacing its results and error.
    ///
    /// Returns `false` if the job is unknown or already terminal.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn update_job_status(
        &self,
        task_id: &TaskId,
        status: JobStatus,
        result_urls: Option<Vec<String>>,
        error_message: Option<String>,
    ) -> Result<bool> {
        let _task = self.locks.tasks.lock(task_id).await;
        let Some(mut job) = self.store.get_job(task_id).await? else {
            tracing::debug!(task_id = %task_id, "Status update for unknown job");
            return Ok(false);
        };
        if job.status.is_terminal() {
            tracing::debug!(
                task_id = %task_id,
                current = %job.status.as_str(),
                requested = %status.as_str(),
                "Status update ignored, job is terminal"
            );
            return Ok(false);
        }

        job.status = status;
        if let Some(urls) = result_urls {
            job.result_urls = normalize_result_urls(urls);
        }
        if let Some(message) = error_message {
            job.error_message = Some(message);
        }
        job.touch();
        self.store.apply(Batch::from(Mutation::PutJob(job))).await?;

        tracing::info!(task_id = %task_id, status = %status.as_str(), "Job status updated");
        Ok(true)
    }

    /// Jobs that have results but were never delivered.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn list_undelivered(&self) -> Result<Vec<Job>> {
        Ok(self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .filter(|job| !job.result_urls.is_empty() && !job.is_delivered())
            .collect())
    }

    /// Non-terminal jobs created more than `stale_after` ago.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn list_stale(&self, stale_after: Duration) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - to_chrono(stale_after);
        Ok(self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .filter(|job| !job.status.is_terminal() && job.created_at < cutoff)
            .collect())
    }

    /// Drop jobs past the TTL, then the oldest beyond the cap.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub async fn prune(&self) -> Result<()> {
        self.store.apply(Batch::from(self.prune_mutation())).await?;
        Ok(())
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
