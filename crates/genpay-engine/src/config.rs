//! Engine configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use genpay_core::DEFAULT_REFERRAL_BONUS_GENERATIONS;

/// Default remote API base URL.
pub const DEFAULT_KIE_API_URL: &str = "https://api.kie.ai";

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Durable store settings.
    pub store: StoreConfig,

    /// Orchestrator settings.
    pub generation: GenerationConfig,

    /// Free-tier limits.
    pub free_tier: FreeTierConfig,

    /// Retention and expiry settings.
    pub retention: RetentionConfig,

    /// Remote API credentials.
    pub kie: KieConfig,
}

/// Which storage engine to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// One JSON document with a backup mirror.
    #[default]
    Json,
    /// `RocksDB` column families (feature `rocksdb-backend`).
    Rocks,
}

/// Durable store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Storage engine (default: json).
    pub backend: StoreBackend,

    /// Data directory (default: "data/genpay").
    pub data_dir: PathBuf,

    /// Limit for a fresh read from disk (default: 10s).
    pub read_timeout: Duration,

    /// Limit for a complete save cycle (default: 30s).
    pub write_timeout: Duration,
}

impl StoreConfig {
    /// Path of the JSON ledger file.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.json")
    }

    /// Path of the `RocksDB` directory.
    #[must_use]
    pub fn rocks_path(&self) -> PathBuf {
        self.data_dir.join("rocks")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            data_dir: PathBuf::from("data/genpay"),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrator and delivery settings.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Pause between status polls (default: 2s).
    pub poll_interval: Duration,

    /// Pause between heartbeat callbacks (default: 12s).
    pub heartbeat_interval: Duration,

    /// Wall-clock budget for waiting on a remote task (default: 300s).
    pub timeout: Duration,

    /// Typical generation time, used for the ETA (default: 60s).
    pub expected_duration: Duration,

    /// Attempts for `createTask` (default: 3).
    pub create_attempts: u32,

    /// Attempts per status poll (default: 3).
    pub poll_attempts: u32,

    /// Attempts for sending a result to the user (default: 3).
    pub send_attempts: u32,

    /// Age after which a delivery lock counts as abandoned (default: 5 min).
    pub delivery_lock_timeout_minutes: i64,

    /// URL the remote API posts completion notifications to.
    pub callback_url: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(12),
            timeout: Duration::from_secs(300),
            expected_duration: Duration::from_secs(60),
            create_attempts: 3,
            poll_attempts: 3,
            send_attempts: 3,
            delivery_lock_timeout_minutes: 5,
            callback_url: None,
        }
    }
}

/// Free-tier limits.
#[derive(Debug, Clone)]
pub struct FreeTierConfig {
    /// Models with a free tier.
    pub free_models: Vec<String>,

    /// Hourly free generations before referral bonus (default: 5).
    pub base_hourly_limit: u32,

    /// Per-model replacements for `base_hourly_limit`.
    pub model_hourly_limits: HashMap<String, u32>,

    /// Daily free generations (default: 50).
    pub daily_limit: u32,

    /// Extra hourly generations a referrer earns per referral (default: 5).
    pub referral_bonus_generations: u32,
}

impl FreeTierConfig {
    /// Whether `model_id` has a free tier.
    #[must_use]
    pub fn is_free_model(&self, model_id: &str) -> bool {
        self.free_models.iter().any(|m| m == model_id)
    }

    /// Hourly limit for `model_id` before referral bonus.
    #[must_use]
    pub fn base_hourly_limit_for(&self, model_id: &str) -> u32 {
        self.model_hourly_limits
            .get(model_id)
            .copied()
            .unwrap_or(self.base_hourly_limit)
    }
}

impl Default for FreeTierConfig {
    fn default() -> Self {
        Self {
            free_models: Vec::new(),
            base_hourly_limit: 5,
            model_hourly_limits: HashMap::new(),
            daily_limit: 50,
            referral_bonus_generations: DEFAULT_REFERRAL_BONUS_GENERATIONS,
        }
    }
}

/// Retention and expiry settings.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Age after which jobs are pruned (default: 1h).
    pub job_ttl: Duration,

    /// Hard cap on stored jobs (default: 5000).
    pub max_jobs: usize,

    /// Age after which free-usage records are pruned (default: 24h).
    pub free_usage_ttl: Duration,

    /// Hard cap on free-usage records (default: 10000).
    pub max_free_usage_records: usize,

    /// Age after which processed event ids are forgotten (default: 24h).
    pub processed_event_ttl: Duration,

    /// Age after which a pending reservation is released (default: 30 min).
    pub reservation_ttl: Duration,

    /// Age after which a non-terminal job is failed (default: 30 min).
    pub stale_job_after: Duration,

    /// Pause between maintenance passes (default: 60s).
    pub maintenance_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_ttl: Duration::from_secs(60 * 60),
            max_jobs: 5000,
            free_usage_ttl: Duration::from_secs(24 * 60 * 60),
            max_free_usage_records: 10_000,
            processed_event_ttl: Duration::from_secs(24 * 60 * 60),
            reservation_ttl: Duration::from_secs(30 * 60),
            stale_job_after: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Remote API credentials.
#[derive(Debug, Clone)]
pub struct KieConfig {
    /// Base URL (default: `https://api.kie.ai`).
    pub api_url: String,

    /// Bearer API key.
    pub api_key: Option<String>,
}

impl Default for KieConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_KIE_API_URL.into(),
            api_key: None,
        }
    }
}

/// Kie secrets file structure.
#[derive(Debug, Deserialize)]
struct KieSecrets {
    #[serde(default)]
    api_url: Option<String>,
    api_key: String,
}

impl EngineConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let backend = match std::env::var("STORE_BACKEND").as_deref() {
            Ok("rocks" | "rocksdb") => StoreBackend::Rocks,
            _ => StoreBackend::Json,
        };

        let store = StoreConfig {
            backend,
            data_dir: std::env::var("DATA_DIR")
                .map_or(defaults.store.data_dir, PathBuf::from),
            read_timeout: env_secs("STORE_READ_TIMEOUT_SECONDS")
                .unwrap_or(defaults.store.read_timeout),
            write_timeout: env_secs("STORE_WRITE_TIMEOUT_SECONDS")
                .unwrap_or(defaults.store.write_timeout),
        };

        let generation = GenerationConfig {
            poll_interval: env_secs("POLL_INTERVAL_SECONDS")
                .unwrap_or(defaults.generation.poll_interval),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECONDS")
                .unwrap_or(defaults.generation.heartbeat_interval),
            timeout: env_secs("GENERATION_TIMEOUT_SECONDS")
                .unwrap_or(defaults.generation.timeout),
            expected_duration: env_secs("EXPECTED_DURATION_SECONDS")
                .unwrap_or(defaults.generation.expected_duration),
            create_attempts: env_parse("CREATE_ATTEMPTS")
                .unwrap_or(defaults.generation.create_attempts),
            poll_attempts: env_parse("POLL_ATTEMPTS").unwrap_or(defaults.generation.poll_attempts),
            send_attempts: env_parse("SEND_ATTEMPTS").unwrap_or(defaults.generation.send_attempts),
            delivery_lock_timeout_minutes: env_parse("DELIVERY_LOCK_TIMEOUT_MINUTES")
                .unwrap_or(defaults.generation.delivery_lock_timeout_minutes),
            callback_url: std::env::var("KIE_CALLBACK_URL").ok(),
        };

        let free_tier = FreeTierConfig {
            free_models: std::env::var("FREE_MODELS")
                .map(|s| {
                    s.split(',')
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            base_hourly_limit: env_parse("FREE_HOURLY_LIMIT")
                .unwrap_or(defaults.free_tier.base_hourly_limit),
            model_hourly_limits: std::env::var("FREE_MODEL_HOURLY_LIMITS")
                .map(|s| parse_model_limits(&s))
                .unwrap_or_default(),
            daily_limit: env_parse("FREE_DAILY_LIMIT").unwrap_or(defaults.free_tier.daily_limit),
            referral_bonus_generations: env_parse("REFERRAL_BONUS_GENERATIONS")
                .unwrap_or(defaults.free_tier.referral_bonus_generations),
        };

        let retention = RetentionConfig {
            job_ttl: env_secs("JOB_TTL_SECONDS").unwrap_or(defaults.retention.job_ttl),
            max_jobs: env_parse("MAX_JOBS").unwrap_or(defaults.retention.max_jobs),
            free_usage_ttl: env_secs("FREE_USAGE_TTL_SECONDS")
                .unwrap_or(defaults.retention.free_usage_ttl),
            max_free_usage_records: env_parse("MAX_FREE_USAGE_RECORDS")
                .unwrap_or(defaults.retention.max_free_usage_records),
            processed_event_ttl: env_secs("PROCESSED_EVENT_TTL_SECONDS")
                .unwrap_or(defaults.retention.processed_event_ttl),
            reservation_ttl: env_secs("RESERVATION_TTL_SECONDS")
                .unwrap_or(defaults.retention.reservation_ttl),
            stale_job_after: env_secs("STALE_JOB_SECONDS")
                .unwrap_or(defaults.retention.stale_job_after),
            maintenance_interval: env_secs("MAINTENANCE_INTERVAL_SECONDS")
                .unwrap_or(defaults.retention.maintenance_interval),
        };

        Self {
            store,
            generation,
            free_tier,
            retention,
            kie: load_kie_secrets(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

/// Parse `model=limit` pairs separated by commas. Malformed pairs are skipped.
fn parse_model_limits(raw: &str) -> HashMap<String, u32> {
    raw.split(',')
        .filter_map(|pair| {
            let (model, limit) = pair.split_once('=')?;
            let model = model.trim();
            if model.is_empty() {
                return None;
            }
            Some((model.to_string(), limit.trim().parse().ok()?))
        })
        .collect()
}

/// Load remote API credentials from file or environment.
fn load_kie_secrets() -> KieConfig {
    // Try multiple paths for the secrets file
    let secret_paths = [
        ".secrets/kie.json",
        "genpay/.secrets/kie.json",
        "../.secrets/kie.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<KieSecrets>(path) {
            tracing::info!(path = %path, "Loaded Kie secrets from file");
            return KieConfig {
                api_url: secrets.api_url.unwrap_or_else(|| DEFAULT_KIE_API_URL.into()),
                api_key: Some(secrets.api_key),
            };
        }
    }

    // Fall back to environment variables
    tracing::debug!("Kie secrets file not found, using environment variables");
    KieConfig {
        api_url: std::env::var("KIE_API_URL").unwrap_or_else(|_| DEFAULT_KIE_API_URL.into()),
        api_key: std::env::var("KIE_API_KEY").ok(),
    }
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.generation.poll_interval, Duration::from_secs(2));
        assert_eq!(config.generation.timeout, Duration::from_secs(300));
        assert_eq!(config.retention.job_ttl, Duration::from_secs(3600));
        assert_eq!(config.retention.max_jobs, 5000);
        assert_eq!(config.retention.max_free_usage_records, 10_000);
        assert_eq!(config.free_tier.referral_bonus_generations, 5);
        assert_eq!(config.store.ledger_path(), PathBuf::from("data/genpay/ledger.json"));
    }

    #[test]
    fn model_limits_parse_and_skip_garbage() {
        let limits = parse_model_limits("z-image=10, flux = 2,broken,=4,nan=x");
        assert_eq!(limits.len(), 2);
        assert_eq!(limits["z-image"], 10);
        assert_eq!(limits["flux"], 2);
    }

    #[test]
    fn model_override_replaces_base_limit() {
        let mut config = FreeTierConfig {
            free_models: vec!["z-image".into()],
            ..FreeTierConfig::default()
        };
        config.model_hourly_limits.insert("z-image".into(), 8);
        assert!(config.is_free_model("z-image"));
        assert!(!config.is_free_model("veo"));
        assert_eq!(config.base_hourly_limit_for("z-image"), 8);
        assert_eq!(config.base_hourly_limit_for("other"), 5);
    }

    #[test]
    fn secrets_file_missing_is_not_found() {
        let err = load_secrets_file::<KieSecrets>("/nonexistent/kie.json").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
