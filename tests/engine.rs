use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parley::config::Config;
use parley::invoker::ModelInvoker;
use parley::retry::{RetryHarness, RetryPolicy};
use parley::server::ParleyServer;
use parley::tools::debate::{DebateOverrides, DebateRequest};

/// Counts every invocation; answers debaters, coordinator, and synthesizer
/// with canned content keyed off the prompt's role header.
struct CountingInvoker {
    calls: AtomicUsize,
}

#[async_trait]
impl ModelInvoker for CountingInvoker {
    async fn call_model(&self, alias: &str, prompt: &str, _project: Option<&Path>) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.starts_with("You are the neutral coordinator") {
            return Some(
                serde_json::json!({
                    "score": 91,
                    "core_agreement": "full agreement",
                    "disagreements": [],
                    "continue_debate": false,
                    "synthesis_ready": true,
                    "reasoning": "canned",
                })
                .to_string(),
            );
        }
        if prompt.starts_with("You are the synthesizer") {
            return Some("the synthesized answer".to_string());
        }
        Some(format!("{alias} proposes the canonical definition"))
    }
}

async fn server_with_counter(logs_dir: &Path) -> (ParleyServer, Arc<CountingInvoker>) {
    let mut config = Config::from_env();
    config.logs_dir = logs_dir.to_path_buf();
    config.cache.persistence_path = None;
    let invoker = Arc::new(CountingInvoker {
        calls: AtomicUsize::new(0),
    });
    let harness = Arc::new(RetryHarness::new(RetryPolicy::default()));
    let server = ParleyServer::with_invoker(Arc::new(config), invoker.clone(), harness).await;
    (server, invoker)
}

fn request(question: &str) -> DebateRequest {
    DebateRequest {
        question: question.to_string(),
        preset: Some("rapid".to_string()),
        project_path: None,
        urgency: None,
        budget: None,
        fresh: None,
        overrides: None,
    }
}

// ---------------------------------------------------------------------------
// Scenario: identical second call is served from cache with zero invoker
// calls.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_second_call_hits_cache_without_invoking_models() {
    let logs = tempfile::tempdir().unwrap();
    let (server, invoker) = server_with_counter(logs.path()).await;

    let first = server.deliberate(&request("What is a closure?")).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.solution, "the synthesized answer");
    assert_eq!(first.synthesized_by, "coordinator");
    let calls_after_first = invoker.calls.load(Ordering::SeqCst);
    assert!(calls_after_first > 0);

    let second = server.deliberate(&request("What is a closure?")).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.solution, first.solution);
    assert_eq!(
        invoker.calls.load(Ordering::SeqCst),
        calls_after_first,
        "cache hit must not invoke any model"
    );

    let stats = server.engine().cache.stats().await;
    assert!(stats.hit_rate >= 0.5, "hit rate {}", stats.hit_rate);
}

#[tokio::test]
async fn fresh_flag_bypasses_the_cache() {
    let logs = tempfile::tempdir().unwrap();
    let (server, invoker) = server_with_counter(logs.path()).await;

    server.deliberate(&request("What is a closure?")).await.unwrap();
    let calls_after_first = invoker.calls.load(Ordering::SeqCst);

    let mut fresh = request("What is a closure?");
    fresh.fresh = Some(true);
    let rerun = server.deliberate(&fresh).await.unwrap();
    assert!(!rerun.from_cache);
    assert!(invoker.calls.load(Ordering::SeqCst) > calls_after_first);
}

// ---------------------------------------------------------------------------
// Scenario: roster permutations address the same cache entry.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn roster_permutation_hits_the_same_entry() {
    let logs = tempfile::tempdir().unwrap();
    let (server, invoker) = server_with_counter(logs.path()).await;

    let with_models = |models: &[&str]| DebateRequest {
        question: "Which caching strategy fits this workload best?".to_string(),
        preset: None,
        project_path: None,
        urgency: None,
        budget: None,
        fresh: None,
        overrides: Some(DebateOverrides {
            models: Some(models.iter().map(|m| m.to_string()).collect()),
            verification: None,
            timeout_minutes: None,
        }),
    };

    let first = server.deliberate(&with_models(&["k1", "k2", "k3"])).await.unwrap();
    assert!(!first.from_cache);
    let calls_after_first = invoker.calls.load(Ordering::SeqCst);

    let second = server.deliberate(&with_models(&["k3", "k1", "k2"])).await.unwrap();
    assert!(second.from_cache, "permuted roster must hit the same entry");
    assert_eq!(invoker.calls.load(Ordering::SeqCst), calls_after_first);
}

// ---------------------------------------------------------------------------
// Scenario: touching a project file invalidates the cached result.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn project_file_change_forces_a_rerun() {
    let logs = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    tokio::fs::write(project.path().join("cache.rs"), "fn probe() {}")
        .await
        .unwrap();
    let (server, invoker) = server_with_counter(logs.path()).await;

    let with_project = || DebateRequest {
        question: "Is the cache invalidation in this project correct?".to_string(),
        preset: Some("rapid".to_string()),
        project_path: Some(project.path().to_string_lossy().to_string()),
        urgency: None,
        budget: None,
        fresh: None,
        overrides: None,
    };

    let first = server.deliberate(&with_project()).await.unwrap();
    assert!(!first.from_cache);
    let calls_after_first = invoker.calls.load(Ordering::SeqCst);

    // Unchanged project: cache hit.
    let cached = server.deliberate(&with_project()).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(invoker.calls.load(Ordering::SeqCst), calls_after_first);

    // Touch a file, re-ask: the engine must deliberate again.
    tokio::fs::write(project.path().join("cache.rs"), "fn probe() { /* changed */ }")
        .await
        .unwrap();
    let rerun = server.deliberate(&with_project()).await.unwrap();
    assert!(!rerun.from_cache, "project change must invalidate");
    assert!(invoker.calls.load(Ordering::SeqCst) > calls_after_first);
}

// ---------------------------------------------------------------------------
// Validation and metadata.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn short_questions_are_rejected_before_any_work() {
    let logs = tempfile::tempdir().unwrap();
    let (server, invoker) = server_with_counter(logs.path()).await;

    let result = server.deliberate(&request("Why?")).await;
    assert!(matches!(
        result,
        Err(parley::error::ParleyError::QuestionTooSimple(_))
    ));
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn result_carries_preset_and_confidence_metadata() {
    let logs = tempfile::tempdir().unwrap();
    let (server, _) = server_with_counter(logs.path()).await;

    let result = server.deliberate(&request("What is a closure?")).await.unwrap();
    let preset = result.preset.expect("preset report present");
    assert_eq!(preset.id, "rapid");
    assert!(preset.selection_reason.contains("rapid"));

    let confidence = result.confidence.expect("confidence report present");
    assert!((0.0..=100.0).contains(&confidence.score));
    assert!(!confidence.factors.is_empty());
    assert!(!result.cancelled);
    assert_eq!(result.rounds, 1);

    // The debate left artifacts and a confidence history behind.
    let names: Vec<String> = std::fs::read_dir(logs.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(names.iter().any(|n| n == "confidence-history.json"));
    assert!(names.iter().any(|n| n.starts_with("iterative_debate_")));
}

#[tokio::test]
async fn unknown_preset_is_rejected() {
    let logs = tempfile::tempdir().unwrap();
    let (server, _) = server_with_counter(logs.path()).await;

    let mut bad = request("What is a closure and when is it useful?");
    bad.preset = Some("warp-speed".to_string());
    assert!(matches!(
        server.deliberate(&bad).await,
        Err(parley::error::ParleyError::Configuration(_))
    ));
}
