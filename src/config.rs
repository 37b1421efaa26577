use crate::error_handler::RetryPolicy;
use crate::observability::logging::{LogLevel, LogRotationPolicy};
use crate::processor::ProcessorOptions;
use crate::runtime::queue::EVENT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Complete runtime configuration for the ingest pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub processing: ProcessingConfig,
    pub orphans: OrphanConfig,
    pub retry: RetryConfig,
    pub metrics: MetricsConfig,
    pub control: ControlConfig,
    pub heartbeat: HeartbeatConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: EVENT_QUEUE_CAPACITY,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub idle_sleep_ms: u64,
    /// Park micrographs whose foil-hole is unknown instead of only counting them.
    pub register_micrograph_orphans: bool,
    /// Re-enqueue retryable failures once their backoff elapses.
    pub requeue_retries: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 100,
            register_micrograph_orphans: false,
            requeue_retries: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    pub timeout_seconds: u64,
    pub sweep_interval_ms: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 3_600,
            sweep_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub latency_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_window: crate::observability::metrics::LATENCY_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub poll_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1_000,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Disabled when absent.
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub join_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub max_bytes: usize,
    pub max_files: usize,
    pub mirror_stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let rotation = LogRotationPolicy::default();
        Self {
            level: LogLevel::Info,
            max_bytes: rotation.max_bytes,
            max_files: rotation.max_files,
            mirror_stderr: false,
        }
    }
}

impl PipelineConfig {
    /// Reads and validates a JSON config file. Missing keys take their defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let payload = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&payload).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::Invalid(
                "config must be a JSON object".to_string(),
            ));
        }
        let config: Self = serde_json::from_value(value).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be > 0".into()));
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid("queue.batch_size must be > 0".into()));
        }
        if self.metrics.latency_window == 0 {
            return Err(ConfigError::Invalid(
                "metrics.latency_window must be > 0".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.orphans.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "orphans.sweep_interval_ms must be > 0".into(),
            ));
        }
        if self.heartbeat.interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_ms must be > 0 when set".into(),
            ));
        }
        Ok(())
    }

    /// Merges a partial `{section: {key: value}}` object, returning the changed
    /// `section.key` names. The config is left untouched when the result is invalid.
    pub fn patch(&mut self, patch: &Value) -> Result<Vec<String>, ConfigError> {
        let patch_map = patch
            .as_object()
            .ok_or_else(|| ConfigError::InvalidPatch("patch must be a JSON object".into()))?;
        let current = serde_json::to_value(&*self).map_err(ConfigError::Parse)?;
        let Value::Object(mut merged) = current else {
            return Err(ConfigError::InvalidPatch(
                "config did not serialize to an object".into(),
            ));
        };
        let mut changed = Vec::new();
        for (section, values) in patch_map {
            let section_patch = values.as_object().ok_or_else(|| {
                ConfigError::InvalidPatch(format!("section '{section}' must be an object"))
            })?;
            let target = merged
                .get_mut(section)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| ConfigError::InvalidPatch(format!("unknown section '{section}'")))?;
            merge_section(section, target, section_patch, &mut changed)?;
        }
        if changed.is_empty() {
            return Ok(changed);
        }
        let next: Self = serde_json::from_value(Value::Object(merged))
            .map_err(|err| ConfigError::InvalidPatch(err.to_string()))?;
        next.validate()?;
        *self = next;
        changed.sort();
        Ok(changed)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn rotation_policy(&self) -> LogRotationPolicy {
        LogRotationPolicy {
            max_bytes: self.logging.max_bytes,
            max_files: self.logging.max_files,
        }
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphans.timeout_seconds)
    }

    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            register_micrograph_orphans: self.processing.register_micrograph_orphans,
            requeue_retries: self.processing.requeue_retries,
        }
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.processing.idle_sleep_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.orphans.sweep_interval_ms)
    }
}

/// Config shared between workers; patches become visible on each worker's next iteration.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<Mutex<PipelineConfig>>,
}

impl SharedConfig {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    pub fn snapshot(&self) -> PipelineConfig {
        self.lock().clone()
    }

    /// Applies a patch and returns the changed keys with the resulting config.
    pub fn patch(&self, patch: &Value) -> Result<(Vec<String>, PipelineConfig), ConfigError> {
        let mut config = self.lock();
        let changed = config.patch(patch)?;
        Ok((changed, config.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, PipelineConfig> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn merge_section(
    section: &str,
    target: &mut Map<String, Value>,
    patch: &Map<String, Value>,
    changed: &mut Vec<String>,
) -> Result<(), ConfigError> {
    for (key, value) in patch {
        let entry = target.get_mut(key).ok_or_else(|| {
            ConfigError::InvalidPatch(format!("unknown key '{section}.{key}'"))
        })?;
        if entry != value {
            *entry = value.clone();
            changed.push(format!("{section}.{key}"));
        }
    }
    Ok(())
}

/// Errors surfaced while loading or patching configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid config patch: {0}")]
    InvalidPatch(String),
}
