//! Remote generation orchestrator.
//!
//! Creates a task on the remote API and polls it until a terminal state or
//! the wall-clock budget runs out. No lock is held while waiting; settling
//! the outcome is the caller's job (see [`GenerationOutcome::settlement`]).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use genpay_client::{ClientError, CreateTaskRequest, TaskApi, TaskState};
use genpay_core::normalize_result_urls;

use crate::config::GenerationConfig;
use crate::retry::RetryPolicy;
use crate::settlement::SettlementAction;

/// Error code when no remote task could be created.
pub const NO_TASK_ID: &str = "NO_TASK_ID";

/// Error code when the budget ran out before a terminal state.
pub const TIMEOUT: &str = "TIMEOUT";

/// Error code when status polls kept failing.
pub const STATUS_UNAVAILABLE: &str = "STATUS_UNAVAILABLE";

/// Error code for a remote failure without a code of its own.
pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";

/// Terminal state of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationState {
    /// The remote task finished with results.
    Success,
    /// The task could not be created, failed remotely, or became
    /// unobservable.
    Fail,
    /// The budget ran out. The remote task is not aborted.
    Timeout,
}

impl GenerationState {
    /// Get the state as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Timeout => "timeout",
        }
    }
}

/// What a generation ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Terminal state.
    pub state: GenerationState,
    /// Remote task id, once one was created.
    pub remote_task_id: Option<String>,
    /// Result URLs (success only).
    pub result_urls: Vec<String>,
    /// Failure code.
    pub error_code: Option<String>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Time spent.
    pub elapsed: Duration,
}

impl GenerationOutcome {
    /// How the task's reservation must be settled.
    #[must_use]
    pub fn settlement(&self) -> SettlementAction {
        match self.state {
            GenerationState::Success => SettlementAction::Commit,
            GenerationState::Fail | GenerationState::Timeout => SettlementAction::Release,
        }
    }

    /// Whether the generation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == GenerationState::Success
    }

    fn failed(
        state: GenerationState,
        remote_task_id: Option<String>,
        code: &str,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            state,
            remote_task_id,
            result_urls: Vec::new(),
            error_code: Some(code.to_string()),
            error_message: Some(message.into()),
            elapsed,
        }
    }
}

/// Heartbeat payload passed while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Time waited so far.
    pub elapsed: Duration,
    /// Expected remaining time, zero once the estimate is exceeded.
    pub eta: Duration,
    /// Status polls made so far.
    pub polls: u32,
}

/// Drives one remote task from creation to a terminal state.
#[derive(Clone)]
pub struct Orchestrator {
    api: Arc<dyn TaskApi>,
    config: GenerationConfig,
}

impl Orchestrator {
    /// Create an orchestrator over a task API.
    #[must_use]
    pub fn new(api: Arc<dyn TaskApi>, config: GenerationConfig) -> Self {
        Self { api, config }
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Create a remote task, retrying transport and API errors.
    ///
    /// # Errors
    ///
    /// Returns a `fail` outcome with code [`NO_TASK_ID`] when the service
    /// returns no id or the attempts run out.
    pub async fn create(&self, request: &CreateTaskRequest) -> Result<String, GenerationOutcome> {
        let started = Instant::now();
        let policy = RetryPolicy::with_attempts(self.config.create_attempts);

        let created = policy
            .run(
                "create_task",
                || self.api.create_task(request),
                ClientError::is_retryable,
            )
            .await;

        match created {
            Ok(Some(task_id)) if !task_id.trim().is_empty() => {
                tracing::info!(model = %request.model, remote_task_id = %task_id, "Remote task created");
                Ok(task_id)
            }
            Ok(_) => {
                tracing::error!(model = %request.model, "createTask returned no task id");
                Err(GenerationOutcome::failed(
                    GenerationState::Fail,
                    None,
                    NO_TASK_ID,
                    "task id not returned",
                    started.elapsed(),
                ))
            }
            Err(exhausted) => {
                tracing::error!(
                    model = %request.model,
                    attempts = %exhausted.attempts,
                    error = %exhausted.error,
                    "createTask failed"
                );
                Err(GenerationOutcome::failed(
                    GenerationState::Fail,
                    None,
                    NO_TASK_ID,
                    exhausted.error.to_string(),
                    started.elapsed(),
                ))
            }
        }
    }

    /// Poll `remote_task_id` until it is terminal or the budget runs out.
    ///
    /// `heartbeat` is called every `heartbeat_interval` while the task is
    /// still running.
    pub async fn wait(
        &self,
        remote_task_id: &str,
        heartbeat: &mut (dyn FnMut(Progress) + Send),
    ) -> GenerationOutcome {
        let started = Instant::now();
        let budget = self.config.timeout;

        match tokio::time::timeout(budget, self.poll_until_terminal(remote_task_id, started, heartbeat))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    remote_task_id = %remote_task_id,
                    timeout_secs = %budget.as_secs(),
                    "Generation timed out"
                );
                GenerationOutcome::failed(
                    GenerationState::Timeout,
                    Some(remote_task_id.to_string()),
                    TIMEOUT,
                    format!("task timeout after {} seconds", budget.as_secs()),
                    started.elapsed(),
                )
            }
        }
    }

    /// Create and wait in one call.
    pub async fn run(
        &self,
        request: &CreateTaskRequest,
        heartbeat: &mut (dyn FnMut(Progress) + Send),
    ) -> GenerationOutcome {
        match self.create(request).await {
            Ok(remote_task_id) => self.wait(&remote_task_id, heartbeat).await,
            Err(outcome) => outcome,
        }
    }

    async fn poll_until_terminal(
        &self,
        remote_task_id: &str,
        started: Instant,
        heartbeat: &mut (dyn FnMut(Progress) + Send),
    ) -> GenerationOutcome {
        let policy = RetryPolicy::with_attempts(self.config.poll_attempts);
        let mut last_heartbeat = started;
        let mut polls = 0u32;

        loop {
            polls = polls.saturating_add(1);
            let polled = policy
                .run(
                    "get_status",
                    || self.api.get_status(remote_task_id),
                    ClientError::is_retryable,
                )
                .await;

            let status = match polled {
                Ok(status) => status,
                Err(exhausted) => {
                    tracing::error!(
                        remote_task_id = %remote_task_id,
                        attempts = %exhausted.attempts,
                        error = %exhausted.error,
                        "Task status unavailable"
                    );
                    return GenerationOutcome::failed(
                        GenerationState::Fail,
                        Some(remote_task_id.to_string()),
                        STATUS_UNAVAILABLE,
                        exhausted.error.to_string(),
                        started.elapsed(),
                    );
                }
            };

            match status.state {
                TaskState::Success => {
                    let result_urls = normalize_result_urls(status.result_urls);
                    tracing::info!(
                        remote_task_id = %remote_task_id,
                        results = %result_urls.len(),
                        polls = %polls,
                        "Generation succeeded"
                    );
                    return GenerationOutcome {
                        state: GenerationState::Success,
                        remote_task_id: Some(remote_task_id.to_string()),
                        result_urls,
                        error_code: None,
                        error_message: None,
                        elapsed: started.elapsed(),
                    };
                }
                TaskState::Fail => {
                    let code = status.error_code.unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                    tracing::warn!(
                        remote_task_id = %remote_task_id,
                        code = %code,
                        message = ?status.error_message,
                        "Generation failed"
                    );
                    return GenerationOutcome {
                        state: GenerationState::Fail,
                        remote_task_id: Some(remote_task_id.to_string()),
                        result_urls: Vec::new(),
                        error_code: Some(code),
                        error_message: status.error_message,
                        elapsed: started.elapsed(),
                    };
                }
                TaskState::Waiting => {}
            }

            let now = Instant::now();
            if now.duration_since(last_heartbeat) >= self.config.heartbeat_interval {
                let elapsed = now.duration_since(started);
                heartbeat(Progress {
                    elapsed,
                    eta: self.config.expected_duration.saturating_sub(elapsed),
                    polls,
                });
                last_heartbeat = now;
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use genpay_client::TaskStatus;

    /// Task API replaying scripted answers; the last status repeats.
    struct ScriptedApi {
        create: Mutex<VecDeque<genpay_client::Result<Option<String>>>>,
        statuses: Mutex<VecDeque<genpay_client::Result<TaskStatus>>>,
        last: TaskStatus,
    }

    impl ScriptedApi {
        fn new(
            create: Vec<genpay_client::Result<Option<String>>>,
            statuses: Vec<genpay_client::Result<TaskStatus>>,
            last: TaskStatus,
        ) -> Arc<Self> {
            Arc::new(Self {
                create: Mutex::new(create.into()),
                statuses: Mutex::new(statuses.into()),
                last,
            })
        }
    }

    #[async_trait]
    impl TaskApi for ScriptedApi {
        async fn create_task(
            &self,
            _request: &CreateTaskRequest,
        ) -> genpay_client::Result<Option<String>> {
            self.create
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Some("remote-1".into())))
        }

        async fn get_status(&self, _task_id: &str) -> genpay_client::Result<TaskStatus> {
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.last.clone()))
        }
    }

    fn api_error() -> ClientError {
        ClientError::Api {
            code: "500".into(),
            message: "upstream".into(),
            status: 500,
        }
    }

    fn success(urls: &[&str]) -> TaskStatus {
        TaskStatus {
            state: TaskState::Success,
            result_urls: urls.iter().map(|u| (*u).to_string()).collect(),
            error_code: None,
            error_message: None,
        }
    }

    fn config() -> GenerationConfig {
        GenerationConfig {
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(12),
            timeout: Duration::from_secs(300),
            expected_duration: Duration::from_secs(60),
            ..GenerationConfig::default()
        }
    }

    fn request() -> CreateTaskRequest {
        CreateTaskRequest::new("z-image", serde_json::json!({"prompt": "cat"}))
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_waiting_with_heartbeats() {
        let mut statuses: Vec<_> = (0..10).map(|_| Ok(TaskStatus::waiting())).collect();
        statuses.push(Ok(success(&["https://cdn.example/a.png"])));
        let api = ScriptedApi::new(vec![], statuses, TaskStatus::waiting());
        let orchestrator = Orchestrator::new(api, config());

        let mut beats = Vec::new();
        let outcome = orchestrator
            .run(&request(), &mut |p: Progress| beats.push(p))
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.settlement(), SettlementAction::Commit);
        assert_eq!(outcome.remote_task_id.as_deref(), Some("remote-1"));
        assert_eq!(outcome.result_urls, vec!["https://cdn.example/a.png"]);
        assert_eq!(outcome.elapsed, Duration::from_secs(20));

        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].elapsed, Duration::from_secs(12));
        assert_eq!(beats[0].eta, Duration::from_secs(48));
        assert_eq!(beats[0].polls, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_times_out() {
        let api = ScriptedApi::new(vec![], vec![], TaskStatus::waiting());
        let orchestrator = Orchestrator::new(api, config());

        let mut beats = Vec::new();
        let outcome = orchestrator
            .wait("remote-9", &mut |p: Progress| beats.push(p))
            .await;

        assert_eq!(outcome.state, GenerationState::Timeout);
        assert_eq!(outcome.error_code.as_deref(), Some(TIMEOUT));
        assert_eq!(outcome.settlement(), SettlementAction::Release);
        assert_eq!(outcome.elapsed, Duration::from_secs(300));
        assert!(beats.len() >= 24);
        assert!(beats.iter().skip(5).all(|p| p.eta == Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_task_id_fails() {
        let api = ScriptedApi::new(vec![Ok(None)], vec![], TaskStatus::waiting());
        let orchestrator = Orchestrator::new(api, config());

        let outcome = orchestrator.run(&request(), &mut |_: Progress| {}).await;
        assert_eq!(outcome.state, GenerationState::Fail);
        assert_eq!(outcome.error_code.as_deref(), Some(NO_TASK_ID));
        assert!(outcome.remote_task_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn create_retries_then_gives_up() {
        let api = ScriptedApi::new(
            vec![Err(api_error()), Err(api_error()), Err(api_error())],
            vec![],
            TaskStatus::waiting(),
        );
        let orchestrator = Orchestrator::new(api.clone(), config());

        let err = orchestrator.create(&request()).await.unwrap_err();
        assert_eq!(err.error_code.as_deref(), Some(NO_TASK_ID));
        assert!(api.create.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn create_recovers_from_transient_error() {
        let api = ScriptedApi::new(
            vec![Err(api_error()), Ok(Some("remote-2".into()))],
            vec![],
            TaskStatus::waiting(),
        );
        let orchestrator = Orchestrator::new(api, config());
        assert_eq!(orchestrator.create(&request()).await.unwrap(), "remote-2");
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_keeps_its_code() {
        let failed = TaskStatus {
            state: TaskState::Fail,
            result_urls: Vec::new(),
            error_code: Some("422".into()),
            error_message: Some("nsfw".into()),
        };
        let api = ScriptedApi::new(vec![], vec![Ok(failed)], TaskStatus::waiting());
        let orchestrator = Orchestrator::new(api, config());

        let outcome = orchestrator.wait("remote-3", &mut |_: Progress| {}).await;
        assert_eq!(outcome.state, GenerationState::Fail);
        assert_eq!(outcome.error_code.as_deref(), Some("422"));
        assert_eq!(outcome.error_message.as_deref(), Some("nsfw"));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_without_code_is_unknown() {
        let failed = TaskStatus {
            state: TaskState::Fail,
            ..TaskStatus::waiting()
        };
        let api = ScriptedApi::new(vec![], vec![Ok(failed)], TaskStatus::waiting());
        let orchestrator = Orchestrator::new(api, config());

        let outcome = orchestrator.wait("remote-4", &mut |_: Progress| {}).await;
        assert_eq!(outcome.error_code.as_deref(), Some(UNKNOWN_ERROR));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_poll_errors_fail_as_unavailable() {
        let api = ScriptedApi::new(
            vec![],
            vec![Ok(TaskStatus::waiting()), Err(api_error()), Err(api_error()), Err(api_error())],
            TaskStatus::waiting(),
        );
        let orchestrator = Orchestrator::new(api, config());

        let outcome = orchestrator.wait("remote-5", &mut |_: Progress| {}).await;
        assert_eq!(outcome.state, GenerationState::Fail);
        assert_eq!(outcome.error_code.as_deref(), Some(STATUS_UNAVAILABLE));
        assert_eq!(outcome.remote_task_id.as_deref(), Some("remote-5"));
    }
}
