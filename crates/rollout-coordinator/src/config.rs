//! Coordinator configuration from environment variables, with checkpoint backend selection
//! and a startup health check.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;

use rollout_kernel::{CheckpointLog, InMemoryCheckpointLog, LifecycleEvent, RetryPolicy};

use crate::error::CoordinatorError;
use crate::failure_policy::FailurePolicyConfig;
use crate::notify::ChannelNotificationSink;

const ENV_KEYS: [&str; 9] = [
    "ROLLOUT_CHECKPOINT_BACKEND",
    "ROLLOUT_SQLITE_DB",
    "ROLLOUT_MAX_RETRIES",
    "ROLLOUT_BACKOFF_BASE_MS",
    "ROLLOUT_BACKOFF_CAP_MS",
    "ROLLOUT_BACKOFF_JITTER",
    "ROLLOUT_MIN_SAMPLES",
    "ROLLOUT_MIN_SAMPLE_RATIO",
    "ROLLOUT_NOTIFY_BUFFER",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorConfig {
    pub backend: CheckpointBackend,
    pub sqlite_db_path: String,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: f64,
    pub min_samples: usize,
    pub min_sample_ratio: f64,
    /// Capacity of the bounded notification channel.
    pub notify_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::Memory,
            sqlite_db_path: "rollout-checkpoints.db".to_string(),
            max_retries: 2,
            backoff_base_ms: 200,
            backoff_cap_ms: 10_000,
            backoff_jitter: 0.0,
            min_samples: 10,
            min_sample_ratio: 0.05,
            notify_buffer: 1024,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, CoordinatorError> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, CoordinatorError> {
        let defaults = Self::default();
        let backend_raw = envs
            .get("ROLLOUT_CHECKPOINT_BACKEND")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "memory".to_string());
        let backend = match backend_raw.as_str() {
            "memory" => CheckpointBackend::Memory,
            "sqlite" => CheckpointBackend::Sqlite,
            other => {
                return Err(CoordinatorError::Config(format!(
                    "invalid ROLLOUT_CHECKPOINT_BACKEND='{other}'. expected one of: memory, sqlite"
                )));
            }
        };
        let sqlite_db_path = envs
            .get("ROLLOUT_SQLITE_DB")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.sqlite_db_path);

        let min_sample_ratio = parse_or(envs, "ROLLOUT_MIN_SAMPLE_RATIO", defaults.min_sample_ratio)?;
        if !(0.0..=1.0).contains(&min_sample_ratio) {
            return Err(CoordinatorError::Config(format!(
                "ROLLOUT_MIN_SAMPLE_RATIO={min_sample_ratio} is outside [0, 1]"
            )));
        }
        let backoff_jitter = parse_or(envs, "ROLLOUT_BACKOFF_JITTER", defaults.backoff_jitter)?;
        if !(0.0..=1.0).contains(&backoff_jitter) {
            return Err(CoordinatorError::Config(format!(
                "ROLLOUT_BACKOFF_JITTER={backoff_jitter} is outside [0, 1]"
            )));
        }
        let notify_buffer = parse_or(envs, "ROLLOUT_NOTIFY_BUFFER", defaults.notify_buffer)?;
        if notify_buffer == 0 {
            return Err(CoordinatorError::Config(
                "ROLLOUT_NOTIFY_BUFFER must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            backend,
            sqlite_db_path,
            max_retries: parse_or(envs, "ROLLOUT_MAX_RETRIES", defaults.max_retries)?,
            backoff_base_ms: parse_or(envs, "ROLLOUT_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_cap_ms: parse_or(envs, "ROLLOUT_BACKOFF_CAP_MS", defaults.backoff_cap_ms)?,
            backoff_jitter,
            min_samples: parse_or(envs, "ROLLOUT_MIN_SAMPLES", defaults.min_samples)?,
            min_sample_ratio,
            notify_buffer,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_exponential_backoff(
            self.max_retries,
            self.backoff_base_ms,
            Some(self.backoff_cap_ms),
            self.backoff_jitter,
        )
    }

    pub fn failure_config(&self) -> FailurePolicyConfig {
        FailurePolicyConfig {
            min_samples: self.min_samples,
            min_sample_ratio: self.min_sample_ratio,
        }
    }

    /// Builds the configured checkpoint log and checks it can be opened.
    /// Bounded lifecycle-event channel sized by `notify_buffer`.
    pub fn notification_channel(&self) -> (ChannelNotificationSink, mpsc::Receiver<LifecycleEvent>) {
        ChannelNotificationSink::new(self.notify_buffer)
    }

    pub fn open_checkpoint_log(&self) -> Result<Arc<dyn CheckpointLog>, CoordinatorError> {
        match self.backend {
            CheckpointBackend::Memory => Ok(Arc::new(InMemoryCheckpointLog::new())),
            CheckpointBackend::Sqlite => self.open_sqlite(),
        }
    }

    #[cfg(feature = "sqlite-persistence")]
    fn open_sqlite(&self) -> Result<Arc<dyn CheckpointLog>, CoordinatorError> {
        let log = rollout_kernel::SqliteCheckpointLog::new(&self.sqlite_db_path);
        log.health_check().map_err(|e| {
            CoordinatorError::Config(format!(
                "checkpoint backend sqlite health check failed for ROLLOUT_SQLITE_DB='{}': {}",
                self.sqlite_db_path, e
            ))
        })?;
        Ok(Arc::new(log))
    }

    #[cfg(not(feature = "sqlite-persistence"))]
    fn open_sqlite(&self) -> Result<Arc<dyn CheckpointLog>, CoordinatorError> {
        Err(CoordinatorError::Config(
            "ROLLOUT_CHECKPOINT_BACKEND=sqlite requires feature 'sqlite-persistence'".to_string(),
        ))
    }
}

fn parse_or<T>(envs: &HashMap<String, String>, key: &str, default: T) -> Result<T, CoordinatorError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match envs.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| CoordinatorError::Config(format!("invalid {key}='{raw}': {e}"))),
    }
}
