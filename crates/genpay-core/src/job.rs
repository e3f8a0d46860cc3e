//! Generation job records.
//!
//! A job tracks one generation request from creation to delivery. Status is
//! driven by the orchestrator and the callback path; the delivery fields are
//! driven by the delivery lock.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::{ChatId, TaskId, UserId};

/// Marker prepended to delivery failures in `error_message`.
pub const DELIVERY_FAIL_MARKER: &str = "[DELIVERY_FAIL]";

/// Status of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded locally, remote task not yet created.
    Queued,
    /// Remote task created, waiting for completion.
    Waiting,
    /// Remote reported progress.
    Running,
    /// Finished and delivered.
    Done,
    /// Failed remotely, timed out, or abandoned.
    Failed,
}

impl JobStatus {
    /// Whether the job can no longer change status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Input for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Local task key, shared with the reservation.
    pub task_id: TaskId,
    /// Requesting user.
    pub user_id: UserId,
    /// Chat the result goes to.
    pub chat_id: Option<ChatId>,
    /// Model being run.
    pub model_id: String,
    /// Opaque generation parameters.
    pub params: serde_json::Value,
    /// Price charged on delivery when no hold covers the job.
    pub price: Decimal,
}

/// A generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Local task key.
    pub task_id: TaskId,

    /// Identifier assigned by the remote API once the task is created.
    #[serde(default)]
    pub remote_task_id: Option<String>,

    /// Requesting user.
    pub user_id: UserId,

    /// Chat the result goes to.
    #[serde(default)]
    pub chat_id: Option<ChatId>,

    /// Model being run.
    pub model_id: String,

    /// Opaque generation parameters.
    #[serde(default)]
    pub params: serde_json::Value,

    /// Price charged on delivery when no hold covers the job.
    #[serde(default)]
    pub price: Decimal,

    /// Current status.
    pub status: JobStatus,

    /// Result locations reported by the remote API.
    #[serde(default)]
    pub result_urls: Vec<String>,

    /// Accumulated error text.
    #[serde(default)]
    pub error_message: Option<String>,

    /// Delivery lock timestamp.
    #[serde(default)]
    pub delivering_at: Option<DateTime<Utc>>,

    /// When the result was delivered.
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,

    /// Set once the delivery has been paid for.
    #[serde(default)]
    pub balance_charged_after_delivery: bool,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a queued job from its input.
    #[must_use]
    pub fn new(input: NewJob) -> Self {
        let now = Utc::now();
        Self {
            task_id: input.task_id,
            remote_task_id: None,
            user_id: input.user_id,
            chat_id: input.chat_id,
            model_id: input.model_id,
            params: input.params,
            price: input.price,
            status: JobStatus::Queued,
            result_urls: Vec::new(),
            error_message: None,
            delivering_at: None,
            delivered_at: None,
            balance_charged_after_delivery: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the result has been delivered.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    /// Whether a delivery lock is held and younger than `timeout`.
    #[must_use]
    pub fn has_fresh_delivery_lock(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.delivering_at
            .is_some_and(|locked_at| now.signed_duration_since(locked_at) < timeout)
    }

    /// Append a delivery failure to the error text.
    pub fn append_delivery_failure(&mut self, error: &str) {
        let line = format!("\n{DELIVERY_FAIL_MARKER} {error}");
        match &mut self.error_message {
            Some(existing) => existing.push_str(&line),
            None => self.error_message = Some(line),
        }
    }

    /// Stamp the update time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Trim result URLs and drop blank entries.
#[must_use]
pub fn normalize_result_urls<I, S>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    urls.into_iter()
        .map(|u| u.as_ref().trim().to_string())
        .filter(|u| !u.is_empty())
        .collect()
}

/// Check that a URL can be sent to a user.
///
/// # Errors
///
/// Returns `ValidationError::InvalidUrl` unless the URL is non-empty and uses
/// `http` or `https`.
pub fn validate_result_url(url: &str) -> Result<(), ValidationError> {
    let trimmed = url.trim();
    let lower = trimmed.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(ValidationError::InvalidUrl {
            url: url.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(NewJob {
            task_id: TaskId::new("job-1").unwrap(),
            user_id: UserId::new(7).unwrap(),
            chat_id: None,
            model_id: "z-image".into(),
            params: serde_json::json!({"prompt": "cat"}),
            price: Decimal::ZERO,
        })
    }

    #[test]
    fn delivery_failures_accumulate() {
        let mut job = job();
        job.append_delivery_failure("chat not found");
        job.append_delivery_failure("timeout");
        assert_eq!(
            job.error_message.as_deref(),
            Some("\n[DELIVERY_FAIL] chat not found\n[DELIVERY_FAIL] timeout")
        );
    }

    #[test]
    fn fresh_lock_window() {
        let mut job = job();
        let now = Utc::now();
        assert!(!job.has_fresh_delivery_lock(now, Duration::minutes(5)));

        job.delivering_at = Some(now - Duration::minutes(4));
        assert!(job.has_fresh_delivery_lock(now, Duration::minutes(5)));

        job.delivering_at = Some(now - Duration::minutes(5));
        assert!(!job.has_fresh_delivery_lock(now, Duration::minutes(5)));
    }

    #[test]
    fn url_checks() {
        assert!(validate_result_url("https://cdn.example.com/a.png").is_ok());
        assert!(validate_result_url("HTTP://cdn.example.com/a.png").is_ok());
        assert!(validate_result_url("ftp://cdn.example.com/a.png").is_err());
        assert!(validate_result_url("https://").is_err());
        assert!(validate_result_url("  ").is_err());
    }

    #[test]
    fn url_normalization() {
        let urls = normalize_result_urls(vec![" https://a ", "", "   ", "https://b"]);
        assert_eq!(urls, vec!["https://a".to_string(), "https://b".to_string()]);
    }
}
