use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use parley::config::{BackendKind, Config};
use parley::gateway::auth::RequestSigner;
use parley::gateway::nonce::NonceStore;
use parley::gateway::ratelimit::RateLimiter;
use parley::gateway::{router, GatewayState};
use parley::invoker::{DispatchInvoker, ModelInvoker};
use parley::retry::{RetryHarness, RetryPolicy};

const SECRET: &[u8] = b"invoker-test-secret";

fn fast_harness(max_retries: usize) -> Arc<RetryHarness> {
    Arc::new(RetryHarness::new(RetryPolicy {
        max_retries,
        initial_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(5),
        multiplier: 2.0,
    }))
}

// ---------------------------------------------------------------------------
// Launcher backend.
// ---------------------------------------------------------------------------

fn launcher_config(executable: &str, args: &[&str]) -> Arc<Config> {
    let mut config = Config::from_env();
    if let Some(entry) = config.aliases.get_mut("k1") {
        entry.backend = BackendKind::Launcher {
            executable: executable.to_string(),
            args_template: args.iter().map(|s| s.to_string()).collect(),
        };
    }
    Arc::new(config)
}

#[tokio::test]
async fn launcher_echoes_prompt_through_stdin() {
    let config = launcher_config("cat", &[]);
    let invoker = DispatchInvoker::new(config, fast_harness(0), None);

    let reply = invoker
        .call_model("k1", "the prompt travels via stdin", None)
        .await;
    assert_eq!(reply.as_deref(), Some("the prompt travels via stdin"));
}

#[tokio::test]
async fn missing_launcher_binary_fails_in_one_attempt() {
    let config = launcher_config("parley-no-such-launcher-binary", &[]);
    let harness = fast_harness(3);
    let invoker = DispatchInvoker::new(config, harness.clone(), None);

    let reply = invoker.call_model("k1", "any prompt", None).await;
    assert!(reply.is_none());

    let stats = harness.stats();
    assert_eq!(stats.total_attempts, 1, "configuration errors are not retried");
    let config_failures = stats
        .failures_by_kind
        .iter()
        .find(|(kind, _)| kind == "configuration")
        .map(|(_, count)| *count)
        .unwrap();
    assert_eq!(config_failures, 1);
}

#[tokio::test]
async fn non_retriable_exit_code_fails_once() {
    // Exit code 3 is outside the retriable wrapper set.
    let config = launcher_config("sh", &["-c", "cat >/dev/null; exit 3"]);
    let harness = fast_harness(3);
    let invoker = DispatchInvoker::new(config, harness.clone(), None);

    let reply = invoker.call_model("k1", "prompt body", None).await;
    assert!(reply.is_none());
    assert_eq!(harness.stats().total_attempts, 1);
}

#[tokio::test]
async fn retriable_exit_code_consumes_the_budget() {
    // Exit code 1 is in the retriable wrapper set.
    let config = launcher_config("sh", &["-c", "cat >/dev/null; exit 1"]);
    let harness = fast_harness(1);
    let invoker = DispatchInvoker::new(config, harness.clone(), None);

    let reply = invoker.call_model("k1", "prompt body", None).await;
    assert!(reply.is_none());
    assert_eq!(harness.stats().total_attempts, 2, "1 + max_retries attempts");
}

#[tokio::test]
async fn unknown_alias_returns_null_without_attempts() {
    let config = Arc::new(Config::from_env());
    let harness = fast_harness(3);
    let invoker = DispatchInvoker::new(config, harness.clone(), None);

    assert!(invoker.call_model("k9", "any prompt at all", None).await.is_none());
    assert_eq!(harness.stats().total_attempts, 0);
}

// ---------------------------------------------------------------------------
// HTTP backend through a signed gateway.
// ---------------------------------------------------------------------------

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Json(serde_json::json!({
                "choices": [{"message": {"content": "stub reply"}}]
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_signed_gateway(secret: &[u8]) -> SocketAddr {
    let upstream = spawn_upstream().await;
    let state = GatewayState {
        alias: "k1".to_string(),
        model_id: "anthropic/claude-sonnet-4".to_string(),
        upstream_url: format!("http://{upstream}/v1/chat/completions"),
        upstream_api_key: "upstream-key".to_string(),
        signer: Some(Arc::new(RequestSigner::new(secret.to_vec()))),
        nonces: Arc::new(NonceStore::new()),
        limiter: Arc::new(RateLimiter::default()),
        client: reqwest::Client::new(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn http_config(gateway: SocketAddr) -> Arc<Config> {
    let mut config = Config::from_env();
    if let Some(entry) = config.aliases.get_mut("k1") {
        entry.backend = BackendKind::Http;
        entry.port = gateway.port();
    }
    Arc::new(config)
}

#[tokio::test]
async fn signed_invocation_round_trips_through_the_gateway() {
    let gateway = spawn_signed_gateway(SECRET).await;
    let config = http_config(gateway);
    let invoker = DispatchInvoker::new(
        config,
        fast_harness(0),
        Some(Arc::new(RequestSigner::new(SECRET.to_vec()))),
    );

    let reply = invoker
        .call_model("k1", "What is a closure in Rust exactly?", None)
        .await;
    assert_eq!(reply.as_deref(), Some("stub reply"));
}

#[tokio::test]
async fn secret_mismatch_fails_fast_without_retries() {
    let gateway = spawn_signed_gateway(SECRET).await;
    let config = http_config(gateway);
    let harness = fast_harness(3);
    // Invoker signs with the wrong secret — the gateway answers 401.
    let invoker = DispatchInvoker::new(
        config,
        harness.clone(),
        Some(Arc::new(RequestSigner::new(b"wrong-secret".to_vec()))),
    );

    let reply = invoker
        .call_model("k1", "What is a closure in Rust exactly?", None)
        .await;
    assert!(reply.is_none());

    let stats = harness.stats();
    assert_eq!(stats.total_attempts, 1, "auth failures are not retried");
    let auth_failures = stats
        .failures_by_kind
        .iter()
        .find(|(kind, _)| kind == "authentication")
        .map(|(_, count)| *count)
        .unwrap();
    assert_eq!(auth_failures, 1);
}

#[tokio::test]
async fn unsigned_invoker_against_unsigned_gateway() {
    let upstream = spawn_upstream().await;
    let state = GatewayState {
        alias: "k1".to_string(),
        model_id: "anthropic/claude-sonnet-4".to_string(),
        upstream_url: format!("http://{upstream}/v1/chat/completions"),
        upstream_api_key: "upstream-key".to_string(),
        signer: None,
        nonces: Arc::new(NonceStore::new()),
        limiter: Arc::new(RateLimiter::default()),
        client: reqwest::Client::new(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let invoker = DispatchInvoker::new(http_config(addr), fast_harness(0), None);
    let reply = invoker
        .call_model("k1", "What is a closure in Rust exactly?", None)
        .await;
    assert_eq!(reply.as_deref(), Some("stub reply"));
}
