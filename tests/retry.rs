use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parley::error::ParleyError;
use parley::retry::{classify, is_retriable, ErrorKind, RetryHarness, RetryPolicy};

fn fast_policy(max_retries: usize) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

// ---------------------------------------------------------------------------
// Budget semantics: at most 1 + max_retries invocations, success passes
// through on whichever attempt it lands.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn succeeds_on_attempt_k_within_budget() {
    let harness = RetryHarness::new(fast_policy(3));
    let calls = Arc::new(AtomicUsize::new(0));

    let calls_in = calls.clone();
    let result = harness
        .execute(move || {
            let calls = calls_in.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ParleyError::Timeout(10))
                } else {
                    Ok("answer")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "answer");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_budget_returns_retry_error_with_attempt_count() {
    let harness = RetryHarness::new(fast_policy(3));
    let calls = Arc::new(AtomicUsize::new(0));

    let calls_in = calls.clone();
    let result: Result<(), _> = harness
        .execute(move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ParleyError::Timeout(10))
            }
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.attempts, 4, "exactly 1 + max_retries invocations");
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(matches!(err.source, ParleyError::Timeout(_)));
}

#[tokio::test]
async fn non_retriable_fails_in_one_attempt() {
    let harness = RetryHarness::new(fast_policy(5));
    let calls = Arc::new(AtomicUsize::new(0));

    let calls_in = calls.clone();
    let result: Result<(), _> = harness
        .execute(move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ParleyError::AuthFailed {
                    provider: "k1".to_string(),
                    message: "401".to_string(),
                })
            }
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.attempts, 1);
    assert_eq!(err.kind, ErrorKind::Authentication);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Classification table.
// ---------------------------------------------------------------------------

#[test]
fn classification_matches_the_taxonomy() {
    let auth = ParleyError::AuthFailed {
        provider: "k1".into(),
        message: "invalid api key".into(),
    };
    assert_eq!(classify(&auth), ErrorKind::Authentication);
    assert!(!is_retriable(&auth));

    let config = ParleyError::Configuration("launcher not found: claude-wrapper".into());
    assert_eq!(classify(&config), ErrorKind::Configuration);
    assert!(!is_retriable(&config));

    let rate = ParleyError::RateLimited {
        provider: "k2".into(),
    };
    assert_eq!(classify(&rate), ErrorKind::RateLimit);
    assert!(is_retriable(&rate));

    assert_eq!(classify(&ParleyError::Timeout(5)), ErrorKind::Timeout);
    assert!(is_retriable(&ParleyError::Timeout(5)));

    let upstream_5xx = ParleyError::Upstream {
        provider: "k3".into(),
        message: "503 unavailable".into(),
        status: Some(503),
    };
    assert_eq!(classify(&upstream_5xx), ErrorKind::Network);
    assert!(is_retriable(&upstream_5xx));

    let upstream_401 = ParleyError::Upstream {
        provider: "k3".into(),
        message: "401".into(),
        status: Some(401),
    };
    assert_eq!(classify(&upstream_401), ErrorKind::Authentication);
    assert!(!is_retriable(&upstream_401));

    let upstream_429 = ParleyError::Upstream {
        provider: "k3".into(),
        message: "too many requests".into(),
        status: Some(429),
    };
    assert_eq!(classify(&upstream_429), ErrorKind::RateLimit);

    assert_eq!(
        classify(&ParleyError::Parse("empty response".into())),
        ErrorKind::Parse
    );
    assert_eq!(
        classify(&ParleyError::Internal("ECONNRESET by peer".into())),
        ErrorKind::Network
    );
    assert_eq!(
        classify(&ParleyError::Internal("something odd".into())),
        ErrorKind::Unknown
    );
}

#[test]
fn wrapper_exit_codes_gate_retriability() {
    for code in [1, 124, 125, 126, 127] {
        let err = ParleyError::LauncherExit {
            code,
            stderr: String::new(),
        };
        assert_eq!(classify(&err), ErrorKind::WrapperExit);
        assert!(is_retriable(&err), "exit code {code} should be retriable");
    }
    for code in [0, 2, 3, 64, 128, 139] {
        let err = ParleyError::LauncherExit {
            code,
            stderr: String::new(),
        };
        assert!(!is_retriable(&err), "exit code {code} should not be retriable");
    }
}

// ---------------------------------------------------------------------------
// Backoff pacing: exponential with cap; rate limits slowed with a 5s floor.
// ---------------------------------------------------------------------------

#[test]
fn backoff_grows_exponentially_and_caps() {
    let policy = RetryPolicy {
        max_retries: 5,
        initial_delay: Duration::from_millis(1_000),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };
    assert_eq!(policy.base_delay(1, ErrorKind::Timeout), Duration::from_secs(1));
    assert_eq!(policy.base_delay(2, ErrorKind::Timeout), Duration::from_secs(2));
    assert_eq!(policy.base_delay(3, ErrorKind::Timeout), Duration::from_secs(4));
    // Capped well before the exponent would take over.
    assert_eq!(policy.base_delay(10, ErrorKind::Timeout), Duration::from_secs(30));
}

#[test]
fn rate_limit_delay_has_multiplier_and_floor() {
    let policy = RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };
    // 100ms base would double to 200ms — the 5s floor wins.
    assert_eq!(
        policy.base_delay(1, ErrorKind::RateLimit),
        Duration::from_secs(5)
    );
    // A large base doubles past the floor.
    let slow = RetryPolicy {
        initial_delay: Duration::from_secs(4),
        max_delay: Duration::from_secs(60),
        ..policy
    };
    assert_eq!(
        slow.base_delay(1, ErrorKind::RateLimit),
        Duration::from_secs(8)
    );
}

// ---------------------------------------------------------------------------
// Statistics.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stats_track_attempts_and_failure_kinds() {
    let harness = RetryHarness::new(fast_policy(1));

    let _ = harness.execute(|| async { Ok::<_, ParleyError>(1) }).await;
    let _: Result<(), _> = harness
        .execute(|| async { Err(ParleyError::Timeout(1)) })
        .await;

    let stats = harness.stats();
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures, 1);
    // 1 success attempt + 2 timeout attempts.
    assert_eq!(stats.total_attempts, 3);
    assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(stats.max_retries_seen, 1);
    let timeout_failures = stats
        .failures_by_kind
        .iter()
        .find(|(kind, _)| kind == "timeout")
        .map(|(_, count)| *count)
        .unwrap();
    assert_eq!(timeout_failures, 1);
}
