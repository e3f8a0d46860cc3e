//! Common test utilities for genpay engine integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tempfile::TempDir;

use genpay_client::{ClientError, CreateTaskRequest, TaskApi, TaskState, TaskStatus};
use genpay_core::{Account, Job, TaskId, UserId};
use genpay_engine::{
    Engine, EngineConfig, FreeTierConfig, GenerationConfig, ResultSender, RetryPolicy, SendError,
};
use genpay_store::{Batch, FileStoreOptions, JsonFileStore, Mutation, Store};

/// Remote task API double with scripted answers.
///
/// `create_task` pops scripted results and falls back to a fresh remote id.
/// `get_status` pops scripted statuses and falls back to the final status.
pub struct FakeTaskApi {
    create: Mutex<VecDeque<genpay_client::Result<Option<String>>>>,
    statuses: Mutex<VecDeque<genpay_client::Result<TaskStatus>>>,
    final_status: Mutex<TaskStatus>,
    create_calls: AtomicU32,
}

impl FakeTaskApi {
    /// An API whose tasks never finish.
    pub fn new() -> Self {
        Self {
            create: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            final_status: Mutex::new(TaskStatus::waiting()),
            create_calls: AtomicU32::new(0),
        }
    }

    /// Queue a `create_task` result.
    pub fn push_create(&self, result: genpay_client::Result<Option<String>>) {
        self.create.lock().unwrap().push_back(result);
    }

    /// Queue a `get_status` result.
    pub fn push_status(&self, result: genpay_client::Result<TaskStatus>) {
        self.statuses.lock().unwrap().push_back(result);
    }

    /// Status returned once the queue is empty.
    pub fn set_final(&self, status: TaskStatus) {
        *self.final_status.lock().unwrap() = status;
    }

    /// Number of `create_task` calls so far.
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskApi for FakeTaskApi {
    async fn create_task(
        &self,
        _request: &CreateTaskRequest,
    ) -> genpay_client::Result<Option<String>> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.create
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Some(format!("remote-{n}"))))
    }

    async fn get_status(&self, _task_id: &str) -> genpay_client::Result<TaskStatus> {
        let scripted = self.statuses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.final_status.lock().unwrap().clone()))
    }
}

/// Result sender that records calls.
pub struct RecordingSender {
    pub calls: AtomicU32,
    pub fail: bool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail: false,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSender for RecordingSender {
    async fn send(&self, _job: &Job, _urls: &[String]) -> Result<(), SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.fail {
            Err(SendError("send failed".into()))
        } else {
            Ok(())
        }
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The engine under test.
    pub engine: Engine,
    /// The store the engine writes to.
    pub store: Arc<dyn Store>,
    /// The remote API double.
    pub api: Arc<FakeTaskApi>,
    /// Temporary directory for the ledger (kept alive for test duration).
    pub _temp_dir: TempDir,
}

impl TestHarness {
    /// Create a harness with a fresh ledger and fast timings.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Create a harness with a fresh ledger and the given configuration.
    pub async fn with_config(config: EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store: Arc<dyn Store> = Arc::new(
            JsonFileStore::open(ledger_path(&temp_dir), FileStoreOptions::default())
                .await
                .expect("Failed to open store"),
        );
        let api = Arc::new(FakeTaskApi::new());
        let engine = Engine::new(Arc::clone(&store), api.clone(), config).with_settle_retry(
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        );

        Self {
            engine,
            store,
            api,
            _temp_dir: temp_dir,
        }
    }

    /// Give a user a starting balance.
    pub async fn fund(&self, user_id: UserId, amount: Decimal) {
        let mut account = Account::new(user_id);
        account.balance = amount;
        self.store
            .apply(Batch::from(Mutation::PutAccount(account)))
            .await
            .expect("Failed to fund account");
    }

    /// Current balance of a user.
    pub async fn balance(&self, user_id: UserId) -> Decimal {
        self.engine.ledger().get_balance(user_id).await
    }
}

/// Engine configuration with millisecond timings and one free model.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        generation: GenerationConfig {
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            timeout: Duration::from_millis(300),
            expected_duration: Duration::from_millis(100),
            ..GenerationConfig::default()
        },
        free_tier: FreeTierConfig {
            free_models: vec![FREE_MODEL.into()],
            ..FreeTierConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// Model with a free tier in [`test_config`].
pub const FREE_MODEL: &str = "z-image";

pub fn ledger_path(dir: &TempDir) -> PathBuf {
    dir.path().join("ledger.json")
}

pub fn user(id: i64) -> UserId {
    UserId::new(id).unwrap()
}

pub fn task(id: &str) -> TaskId {
    TaskId::new(id).unwrap()
}

pub fn success(urls: &[&str]) -> TaskStatus {
    TaskStatus {
        state: TaskState::Success,
        result_urls: urls.iter().map(|u| (*u).to_string()).collect(),
        error_code: None,
        error_message: None,
    }
}

pub fn failure(code: &str, message: &str) -> TaskStatus {
    TaskStatus {
        state: TaskState::Fail,
        result_urls: Vec::new(),
        error_code: Some(code.into()),
        error_message: Some(message.into()),
    }
}

pub fn api_error() -> ClientError {
    ClientError::Api {
        code: "500".into(),
        message: "upstream unavailable".into(),
        status: 500,
    }
}
