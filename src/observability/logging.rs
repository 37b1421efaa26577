use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Severity levels, adjustable at runtime through `update_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rotation policy for the in-memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 8 << 20,
            max_files: 4,
        }
    }
}

/// Accumulated log lines for a rotated segment.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    lines: Vec<String>,
    bytes_written: usize,
}

impl LogFile {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

/// JSON-line logger with deterministic rotation semantics.
#[derive(Debug, Clone)]
pub struct JsonLineLogger {
    policy: LogRotationPolicy,
    current_level: LogLevel,
    mirror_stderr: bool,
    files: VecDeque<LogFile>,
    active: LogFile,
}

impl JsonLineLogger {
    pub fn new(policy: LogRotationPolicy) -> Self {
        Self {
            policy,
            current_level: LogLevel::Info,
            mirror_stderr: false,
            files: VecDeque::new(),
            active: LogFile::default(),
        }
    }

    /// Also writes every accepted line to stderr.
    pub fn with_stderr_mirror(mut self, enabled: bool) -> Self {
        self.mirror_stderr = enabled;
        self
    }

    pub fn level(&self) -> LogLevel {
        self.current_level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.current_level = level;
    }

    /// Emits a JSON-line log entry.
    pub fn log(
        &mut self,
        ts_ms: u64,
        level: LogLevel,
        module: &str,
        file_path: Option<&str>,
        message: &str,
    ) -> Result<(), LoggingError> {
        if level < self.current_level {
            return Ok(());
        }
        let record = LogRecord {
            ts: ts_ms,
            level: level.as_str(),
            module,
            file_path,
            message,
        };
        let line = serde_json::to_string(&record).map_err(LoggingError::Serialize)?;
        if self.mirror_stderr {
            eprintln!("{line}");
        }
        self.rotate_if_needed(line.len());
        self.active.bytes_written = self.active.bytes_written.saturating_add(line.len());
        self.active.lines.push(line);
        Ok(())
    }

    /// Returns rotated history followed by the active segment.
    pub fn files(&self) -> impl Iterator<Item = &LogFile> {
        self.files.iter().chain(std::iter::once(&self.active))
    }

    fn rotate_if_needed(&mut self, next_line_len: usize) {
        if self.active.bytes_written + next_line_len <= self.policy.max_bytes {
            return;
        }
        if !self.active.lines.is_empty() {
            self.files.push_back(std::mem::take(&mut self.active));
            while self.files.len() > self.policy.max_files {
                self.files.pop_front();
            }
        }
        self.active = LogFile::default();
    }
}

/// Errors surfaced while serializing JSON-line logs.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl LoggingError {
    /// Plain-text stand-in for a record that could not be written as JSON.
    pub fn fallback_line(&self, level: LogLevel, module: &str, message: &str) -> String {
        format!("{level} {module}: {message} (log record dropped: {self})")
    }
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    module: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_path: Option<&'a str>,
    message: &'a str,
}

/// Cloneable handle sharing one [`JsonLineLogger`] across worker threads.
#[derive(Debug, Clone)]
pub struct PipelineLog {
    inner: Arc<Mutex<JsonLineLogger>>,
}

impl Default for PipelineLog {
    fn default() -> Self {
        Self::new(JsonLineLogger::new(LogRotationPolicy::default()))
    }
}

impl PipelineLog {
    pub fn new(logger: JsonLineLogger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(logger)),
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.lock().set_level(level);
    }

    pub fn level(&self) -> LogLevel {
        self.lock().level()
    }

    /// Never fails the caller: a record that cannot be serialized is reported
    /// on stderr through [`LoggingError::fallback_line`].
    pub fn log(&self, level: LogLevel, module: &str, file_path: Option<&str>, message: &str) {
        if let Err(err) = self.lock().log(now_ms(), level, module, file_path, message) {
            eprintln!("{}", err.fallback_line(level, module, message));
        }
    }

    pub fn debug(&self, module: &str, file_path: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, module, file_path, message);
    }

    pub fn info(&self, module: &str, file_path: Option<&str>, message: &str) {
        self.log(LogLevel::Info, module, file_path, message);
    }

    pub fn warn(&self, module: &str, file_path: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, module, file_path, message);
    }

    pub fn error(&self, module: &str, file_path: Option<&str>, message: &str) {
        self.log(LogLevel::Error, module, file_path, message);
    }

    /// Copies every retained line, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lock()
            .files()
            .flat_map(|file| file.lines().iter().cloned())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, JsonLineLogger> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
