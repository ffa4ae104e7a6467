use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::error::ParleyError;

/// Exit codes from launcher wrappers that indicate a transient condition
/// (generic failure, shell timeout, command-not-runnable family).
const RETRIABLE_EXIT_CODES: [i32; 5] = [1, 124, 125, 126, 127];

/// Classification of a failed model invocation. Drives whether the harness
/// retries and how the backoff is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Configuration,
    RateLimit,
    Timeout,
    Network,
    WrapperExit,
    Parse,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Configuration => "configuration",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::WrapperExit => "wrapper_exit",
            Self::Parse => "parse",
            Self::Unknown => "unknown",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Authentication => 0,
            Self::Configuration => 1,
            Self::RateLimit => 2,
            Self::Timeout => 3,
            Self::Network => 4,
            Self::WrapperExit => 5,
            Self::Parse => 6,
            Self::Unknown => 7,
        }
    }
}

/// Classify an error by variant, message text, and HTTP status.
pub fn classify(error: &ParleyError) -> ErrorKind {
    match error {
        ParleyError::AuthFailed { .. } | ParleyError::ReplayDetected => ErrorKind::Authentication,
        ParleyError::Configuration(_) | ParleyError::AliasNotFound(_) => ErrorKind::Configuration,
        ParleyError::RateLimited { .. } => ErrorKind::RateLimit,
        ParleyError::Timeout(_) | ParleyError::Cancelled(_) => ErrorKind::Timeout,
        ParleyError::LauncherExit { .. } => ErrorKind::WrapperExit,
        ParleyError::Parse(_) => ErrorKind::Parse,
        ParleyError::Upstream { status, message, .. } => match status {
            Some(401) | Some(403) => ErrorKind::Authentication,
            Some(429) => ErrorKind::RateLimit,
            Some(408) | Some(504) => ErrorKind::Timeout,
            Some(s) if *s >= 500 => ErrorKind::Network,
            _ => classify_message(message),
        },
        ParleyError::Request(e) => {
            if e.is_timeout() {
                ErrorKind::Timeout
            } else if e.is_connect() {
                ErrorKind::Network
            } else {
                match e.status().map(|s| s.as_u16()) {
                    Some(401) | Some(403) => ErrorKind::Authentication,
                    Some(429) => ErrorKind::RateLimit,
                    Some(408) | Some(504) => ErrorKind::Timeout,
                    Some(s) if s >= 500 => ErrorKind::Network,
                    _ => ErrorKind::Network,
                }
            }
        }
        ParleyError::Internal(message) => classify_message(message),
        ParleyError::QuestionTooSimple(_) | ParleyError::InsufficientResponses { .. } => {
            ErrorKind::Configuration
        }
    }
}

/// Message-text heuristics for errors that arrive without structure.
fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("invalid api key") || lower.contains("unauthorized") {
        ErrorKind::Authentication
    } else if lower.contains("enoent") || lower.contains("no such file") {
        ErrorKind::Configuration
    } else if lower.contains("too many requests") || lower.contains("rate limit") {
        ErrorKind::RateLimit
    } else if lower.contains("etimedout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("econnreset") || lower.contains("econnrefused") {
        ErrorKind::Network
    } else if lower.contains("empty response") || lower.contains("malformed") {
        ErrorKind::Parse
    } else {
        ErrorKind::Unknown
    }
}

/// Whether the harness should retry this failure at all.
pub fn is_retriable(error: &ParleyError) -> bool {
    match classify(error) {
        ErrorKind::Authentication | ErrorKind::Configuration => false,
        ErrorKind::WrapperExit => match error {
            ParleyError::LauncherExit { code, .. } => RETRIABLE_EXIT_CODES.contains(code),
            _ => true,
        },
        _ => true,
    }
}

/// Failure surfaced after the retry budget is exhausted (or immediately for
/// non-retriable kinds). Carries the original error and attempt count.
#[derive(Debug, Error)]
#[error("{kind:?} failure after {attempts} attempt(s): {source}")]
pub struct RetryError {
    #[source]
    pub source: ParleyError,
    pub kind: ErrorKind,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Base delay before attempt N+1 (attempt is 1-based): capped exponential,
    /// with a ×2 multiplier and 5-second floor for rate-limit failures.
    pub fn base_delay(&self, attempt: usize, kind: ErrorKind) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay = self
            .max_delay
            .min(Duration::from_secs_f64(self.initial_delay.as_secs_f64() * exp));
        if kind == ErrorKind::RateLimit {
            delay = (delay * 2).max(Duration::from_secs(5));
        }
        delay
    }
}

/// Uniform jitter in ±10% of the base delay.
fn with_jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as f64;
    let spread = base_ms * 0.1;
    let jitter = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base_ms + jitter).max(0.0) as u64)
}

const KIND_COUNT: usize = 8;

/// Applies one fallible async operation with bounded, classified retries.
pub struct RetryHarness {
    policy: RetryPolicy,
    total_attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries_total: AtomicU64,
    retries_max: AtomicU64,
    failures_by_kind: [AtomicU64; KIND_COUNT],
}

/// Consistent read of the harness counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RetryStats {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_retries: f64,
    pub max_retries_seen: u64,
    pub failures_by_kind: Vec<(String, u64)>,
}

impl RetryHarness {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            total_attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            retries_max: AtomicU64::new(0),
            failures_by_kind: Default::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying retriable failures up to `1 + max_retries` total
    /// invocations. Non-retriable failures surface immediately.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ParleyError>>,
    {
        self.execute_with_budget(self.policy.max_retries, &mut op).await
    }

    /// Like `execute`, with a per-call override of the retry budget.
    pub async fn execute_with_budget<T, F, Fut>(
        &self,
        max_retries: usize,
        op: &mut F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ParleyError>>,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            self.total_attempts.fetch_add(1, Ordering::Relaxed);

            match op().await {
                Ok(value) => {
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    self.record_retries((attempt - 1) as u64);
                    return Ok(value);
                }
                Err(error) => {
                    let kind = classify(&error);
                    let retriable = is_retriable(&error);
                    if !retriable || attempt > max_retries {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        self.failures_by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
                        self.record_retries((attempt - 1) as u64);
                        return Err(RetryError {
                            source: error,
                            kind,
                            attempts: attempt,
                        });
                    }

                    let delay = with_jitter(self.policy.base_delay(attempt, kind));
                    tracing::debug!(
                        kind = kind.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure: {error}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn record_retries(&self, retries: u64) {
        self.retries_total.fetch_add(retries, Ordering::Relaxed);
        self.retries_max.fetch_max(retries, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RetryStats {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let completed = successes + failures;
        let retries_total = self.retries_total.load(Ordering::Relaxed);
        let kinds = [
            ErrorKind::Authentication,
            ErrorKind::Configuration,
            ErrorKind::RateLimit,
            ErrorKind::Timeout,
            ErrorKind::Network,
            ErrorKind::WrapperExit,
            ErrorKind::Parse,
            ErrorKind::Unknown,
        ];
        RetryStats {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successes,
            failures,
            success_rate: if completed == 0 {
                0.0
            } else {
                successes as f64 / completed as f64
            },
            avg_retries: if completed == 0 {
                0.0
            } else {
                retries_total as f64 / completed as f64
            },
            max_retries_seen: self.retries_max.load(Ordering::Relaxed),
            failures_by_kind: kinds
                .iter()
                .map(|k| {
                    (
                        k.as_str().to_string(),
                        self.failures_by_kind[k.index()].load(Ordering::Relaxed),
                    )
                })
                .collect(),
        }
    }
}
