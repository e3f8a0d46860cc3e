//! Money-safety engine for genpay.
//!
//! This crate ties the store and the remote task API together:
//!
//! - Balance ledger with checked subtraction
//! - Charge reservations (hold, then commit or release exactly once)
//! - Delivery lock with charge-after-delivery
//! - Free-tier limiter with referral bonus
//! - Remote generation orchestrator with the paid and free generation flows
//! - Callback handling, event dedupe and periodic maintenance
//!
//! # Locking
//!
//! Every read-modify-write holds a per-task and/or per-account async mutex
//! across the store write. Task locks are always taken before account locks.
//! No lock is held while waiting on the remote API.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use genpay_client::KieClient;
//! use genpay_engine::{Engine, EngineConfig};
//! use genpay_store::{FileStoreOptions, JsonFileStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env();
//! let store = JsonFileStore::open(config.store.ledger_path(), FileStoreOptions::default()).await?;
//! let api = KieClient::new(&config.kie.api_url, "api-key")?;
//!
//! let engine = Engine::new(Arc::new(store), Arc::new(api), config);
//! let balance = engine.ledger().get_balance(genpay_core::UserId::new(42)?).await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod events;
pub mod jobs;
pub mod ledger;
pub mod limiter;
pub mod locks;
pub mod orchestrator;
pub mod referrals;
pub mod reservations;
pub mod retry;
pub mod settlement;

pub use config::{
    EngineConfig, FreeTierConfig, GenerationConfig, KieConfig, RetentionConfig, StoreBackend,
    StoreConfig,
};
pub use delivery::{ChargeOutcome, DeliveryLock, DeliveryReport, ResultSender, SendError};
pub use engine::{
    CallbackOutcome, Engine, FreeGenerationOutcome, FreeGenerationRequest, FreeSlot, Funds,
    MaintenanceReport, PaidGenerationOutcome, PaidGenerationRequest,
};
pub use error::{EngineError, Result};
pub use events::EventLog;
pub use jobs::JobTable;
pub use ledger::Ledger;
pub use limiter::FreeUsageLimiter;
pub use locks::{KeyedLocks, Locks};
pub use orchestrator::{GenerationOutcome, GenerationState, Orchestrator, Progress};
pub use referrals::Referrals;
pub use reservations::ReservationManager;
pub use retry::RetryPolicy;
pub use settlement::SettlementAction;
