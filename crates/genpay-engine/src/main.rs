//! genpay worker - runs periodic maintenance over the ledger.
//!
//! Expires abandoned holds, fails stale jobs and prunes old records until
//! interrupted.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genpay_client::KieClient;
use genpay_engine::{Engine, EngineConfig, EngineError, StoreBackend, StoreConfig};
use genpay_store::{FileStoreOptions, JsonFileStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,genpay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting genpay worker");

    // Load configuration from environment
    let config = EngineConfig::from_env();

    tracing::info!(
        backend = ?config.store.backend,
        data_dir = %config.store.data_dir.display(),
        kie_api_url = %config.kie.api_url,
        kie_configured = %config.kie.api_key.is_some(),
        free_models = ?config.free_tier.free_models,
        "Worker configuration loaded"
    );

    let store = open_store(&config.store).await?;

    let api_key = config
        .kie
        .api_key
        .clone()
        .ok_or_else(|| EngineError::Configuration("KIE_API_KEY is not set".into()))?;
    let api = KieClient::new(&config.kie.api_url, api_key)?;

    let interval = config.retention.maintenance_interval;
    let engine = Engine::new(store, Arc::new(api), config);

    tracing::info!(interval_secs = %interval.as_secs(), "Maintenance loop started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = engine.run_maintenance().await;
                if report.failed_steps > 0 {
                    tracing::warn!(failed_steps = %report.failed_steps, "Maintenance pass incomplete");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    tracing::info!("genpay worker stopped");
    Ok(())
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.backend {
        StoreBackend::Json => {
            let path = config.ledger_path();
            tracing::info!(path = %path.display(), "Opening JSON ledger");
            let options = FileStoreOptions {
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
            };
            Ok(Arc::new(JsonFileStore::open(path, options).await?))
        }
        #[cfg(feature = "rocksdb-backend")]
        StoreBackend::Rocks => {
            let path = config.rocks_path();
            tracing::info!(path = %path.display(), "Opening RocksDB store");
            Ok(Arc::new(genpay_store::RocksStore::open(path)?))
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StoreBackend::Rocks => Err(EngineError::Configuration(
            "STORE_BACKEND=rocks requires the rocksdb-backend feature".into(),
        )
        .into()),
    }
}
