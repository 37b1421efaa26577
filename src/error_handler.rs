use crate::collaborators::{DatastoreError, ParseError, ParseErrorKind};
use crate::entity::EntityType;
use crate::event::ClassifiedEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Failure raised while building or persisting one entity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessingError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error("{entity} event at {path} carries no natural id")]
    MissingIdentity { entity: EntityType, path: String },
    #[error("{entity} event at {path} names no parent to wait on")]
    MissingParent { entity: EntityType, path: String },
    #[error("{0}")]
    Other(String),
}

/// Retry-relevant classification of a [`ProcessingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PermanentCorrupt,
    PermanentMissing,
    TransientParser,
    TransientApi,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::PermanentCorrupt => "permanent_corrupt",
            ErrorCategory::PermanentMissing => "permanent_missing",
            ErrorCategory::TransientParser => "transient_parser",
            ErrorCategory::TransientApi => "transient_api",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Only transient categories are ever retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::TransientParser | ErrorCategory::TransientApi
        )
    }

    pub fn all() -> [ErrorCategory; 5] {
        [
            ErrorCategory::PermanentCorrupt,
            ErrorCategory::PermanentMissing,
            ErrorCategory::TransientParser,
            ErrorCategory::TransientApi,
            ErrorCategory::Unknown,
        ]
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt budget and exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Per-path retry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u32,
    pub first_seen_at: Instant,
    pub last_attempt_at: Instant,
    pub category: ErrorCategory,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    /// Paths currently holding retry state.
    pub active_errors: usize,
    /// Cumulative errors seen per category.
    pub error_counts: BTreeMap<String, u64>,
    /// Paths currently retrying, per category.
    pub errors_by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
struct ScheduledRetry {
    due_at: Instant,
    event: ClassifiedEvent,
}

#[derive(Debug, Default)]
struct ErrorState {
    policy: RetryPolicy,
    retries: HashMap<String, RetryState>,
    failed_paths: HashSet<String>,
    error_counts: BTreeMap<ErrorCategory, u64>,
    scheduled: Vec<ScheduledRetry>,
}

/// Classifies processing failures and tracks retry eligibility per file path.
#[derive(Debug, Default)]
pub struct ErrorHandler {
    state: Mutex<ErrorState>,
}

impl ErrorHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(ErrorState {
                policy,
                ..ErrorState::default()
            }),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.lock().policy
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        self.lock().policy = policy;
    }

    /// Maps an error to its category. Depends only on the error value.
    pub fn categorize_error(&self, error: &ProcessingError, _file_path: &str) -> ErrorCategory {
        categorize(error)
    }

    /// True when the error is transient and the path still has attempts left.
    pub fn should_retry(&self, error: &ProcessingError, file_path: &str) -> bool {
        if !categorize(error).is_retryable() {
            return false;
        }
        let state = self.lock();
        let attempts = state
            .retries
            .get(file_path)
            .map_or(0, |retry| retry.attempt_count);
        attempts < state.policy.max_retries
    }

    /// Counts one more failed attempt for the path and returns its updated state.
    pub fn record_retry(&self, file_path: &str, category: ErrorCategory) -> RetryState {
        let now = Instant::now();
        let mut state = self.lock();
        *state.error_counts.entry(category).or_insert(0) += 1;
        let retry = state
            .retries
            .entry(file_path.to_string())
            .or_insert(RetryState {
                attempt_count: 0,
                first_seen_at: now,
                last_attempt_at: now,
                category,
            });
        retry.attempt_count = retry.attempt_count.saturating_add(1);
        retry.last_attempt_at = now;
        retry.category = category;
        *retry
    }

    pub fn record_success(&self, file_path: &str) {
        let mut state = self.lock();
        state.retries.remove(file_path);
        state.failed_paths.remove(file_path);
        state
            .scheduled
            .retain(|retry| retry.event.path_key() != file_path);
    }

    /// Marks the path failed until a fresh filesystem event clears it.
    pub fn record_permanent_failure(
        &self,
        error: &ProcessingError,
        file_path: &str,
    ) -> ErrorCategory {
        let category = categorize(error);
        let mut state = self.lock();
        *state.error_counts.entry(category).or_insert(0) += 1;
        state.retries.remove(file_path);
        state
            .scheduled
            .retain(|retry| retry.event.path_key() != file_path);
        state.failed_paths.insert(file_path.to_string());
        category
    }

    pub fn retry_state(&self, file_path: &str) -> Option<RetryState> {
        self.lock().retries.get(file_path).copied()
    }

    /// Backoff before the next attempt for the path.
    pub fn retry_delay(&self, file_path: &str) -> Duration {
        let state = self.lock();
        let attempts = state
            .retries
            .get(file_path)
            .map_or(1, |retry| retry.attempt_count.max(1));
        state.policy.delay_for_attempt(attempts)
    }

    pub fn is_marked_failed(&self, file_path: &str) -> bool {
        self.lock().failed_paths.contains(file_path)
    }

    /// Called when a new filesystem event arrives for a path.
    pub fn clear_failure(&self, file_path: &str) {
        self.lock().failed_paths.remove(file_path);
    }

    /// Schedules the event for re-delivery once its backoff elapses.
    pub fn schedule_retry(&self, event: ClassifiedEvent, now: Instant) -> Instant {
        let path = event.path_key();
        let due_at = now + self.retry_delay(&path);
        let mut state = self.lock();
        state.scheduled.retain(|retry| retry.event.path_key() != path);
        state.scheduled.push(ScheduledRetry { due_at, event });
        due_at
    }

    /// Removes and returns scheduled retries that are due, oldest deadline first.
    pub fn take_due_retries(&self, now: Instant) -> Vec<ClassifiedEvent> {
        let mut state = self.lock();
        let ErrorState {
            scheduled,
            failed_paths,
            ..
        } = &mut *state;
        let mut due = Vec::new();
        scheduled.retain(|retry| {
            if retry.due_at <= now {
                due.push(retry.clone());
                false
            } else {
                true
            }
        });
        due.retain(|retry| !failed_paths.contains(&retry.event.path_key()));
        due.sort_by_key(|retry| retry.due_at);
        due.into_iter().map(|retry| retry.event).collect()
    }

    pub fn scheduled_retries(&self) -> usize {
        self.lock().scheduled.len()
    }

    pub fn get_error_stats(&self) -> ErrorStats {
        let state = self.lock();
        let mut errors_by_category = BTreeMap::new();
        for retry in state.retries.values() {
            *errors_by_category
                .entry(retry.category.as_str().to_string())
                .or_insert(0) += 1;
        }
        ErrorStats {
            active_errors: state.retries.len(),
            error_counts: state
                .error_counts
                .iter()
                .map(|(category, count)| (category.as_str().to_string(), *count))
                .collect(),
            errors_by_category,
        }
    }

    /// Drops retry state, failure marks, and counters.
    pub fn reset(&self) {
        let mut state = self.lock();
        let policy = state.policy;
        *state = ErrorState {
            policy,
            ..ErrorState::default()
        };
    }

    fn lock(&self) -> MutexGuard<'_, ErrorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn categorize(error: &ProcessingError) -> ErrorCategory {
    match error {
        ProcessingError::Parse(parse) => match parse.kind {
            ParseErrorKind::Malformed => ErrorCategory::PermanentCorrupt,
            ParseErrorKind::MissingFile => ErrorCategory::PermanentMissing,
            ParseErrorKind::Incomplete | ParseErrorKind::Io => ErrorCategory::TransientParser,
        },
        ProcessingError::Datastore(api) => match api {
            DatastoreError::Timeout | DatastoreError::Connection(_) => ErrorCategory::TransientApi,
            DatastoreError::Http { status, .. } if is_transient_status(*status) => {
                ErrorCategory::TransientApi
            }
            DatastoreError::Http { .. } | DatastoreError::Rejected(_) => ErrorCategory::Unknown,
        },
        ProcessingError::MissingIdentity { .. } | ProcessingError::MissingParent { .. } => {
            ErrorCategory::PermanentCorrupt
        }
        ProcessingError::Other(message) => categorize_message(message),
    }
}

/// 5xx, plus 404 (parent not yet visible remotely), 408 and 429.
fn is_transient_status(status: u16) -> bool {
    (500..600).contains(&status) || matches!(status, 404 | 408 | 429)
}

fn categorize_message(message: &str) -> ErrorCategory {
    let lowered = message.to_ascii_lowercase();
    if ["corrupt", "malformed", "unparseable", "invalid xml"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        ErrorCategory::PermanentCorrupt
    } else if ["no such file", "not found", "missing"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        ErrorCategory::PermanentMissing
    } else if ["timed out", "timeout", "connection"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        ErrorCategory::TransientApi
    } else if ["truncated", "still being written", "unexpected eof"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        ErrorCategory::TransientParser
    } else {
        ErrorCategory::Unknown
    }
}
