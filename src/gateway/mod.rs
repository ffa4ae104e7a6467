pub mod audit;
pub mod auth;
pub mod nonce;
pub mod ratelimit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::config::{AliasRole, Config};
use crate::gateway::auth::{
    AuthFailure, RequestSigner, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use crate::gateway::nonce::NonceStore;
use crate::gateway::ratelimit::RateLimiter;

/// Shared state of one per-alias listener.
#[derive(Clone)]
pub struct GatewayState {
    pub alias: String,
    pub model_id: String,
    pub upstream_url: String,
    pub upstream_api_key: String,
    pub signer: Option<Arc<RequestSigner>>,
    pub nonces: Arc<NonceStore>,
    pub limiter: Arc<RateLimiter>,
    pub client: reqwest::Client,
}

/// Build the router for one listener. Exposed for in-process tests.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/health", get(handle_health))
        .layer(axum::middleware::map_response(apply_security_headers))
        .with_state(state)
}

/// Spawn one listener per configured alias (coordinator included).
/// Any startup failure — missing backend credentials, port conflict — is
/// fatal; the caller turns it into exit status 1.
pub async fn spawn_listeners(
    config: &Config,
    nonces: Arc<NonceStore>,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let upstream_api_key = config
        .gateway
        .upstream_api_key
        .clone()
        .context("gateway startup: no upstream API key configured")?;

    let signer = signer_from(config);
    let limiter = Arc::new(RateLimiter::default());
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .expect("failed to build HTTP client");

    let mut handles = Vec::new();
    let mut entries: Vec<(&String, &crate::config::AliasEntry)> = config.aliases.iter().collect();
    entries.sort_by_key(|(name, _)| name.as_str());

    for (alias, entry) in entries {
        if entry.role == AliasRole::Debater && !matches!(entry.backend, crate::config::BackendKind::Http) {
            // Launcher-backed aliases are reached by subprocess, not HTTP.
            continue;
        }
        let state = GatewayState {
            alias: alias.clone(),
            model_id: entry.model_id.clone(),
            upstream_url: config.gateway.upstream_url.clone(),
            upstream_api_key: upstream_api_key.clone(),
            signer: signer.clone(),
            nonces: nonces.clone(),
            limiter: limiter.clone(),
            client: client.clone(),
        };

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", entry.port))
            .await
            .with_context(|| format!("gateway startup: cannot bind port {} for {alias}", entry.port))?;
        tracing::info!(alias = %alias, port = entry.port, "gateway listener up");

        let app = router(state);
        let alias_for_log = alias.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                tracing::error!(alias = %alias_for_log, "gateway listener failed: {e}");
            }
        }));
    }

    Ok(handles)
}

pub fn signer_from(config: &Config) -> Option<Arc<RequestSigner>> {
    if !config.gateway.signing_enabled {
        return None;
    }
    config
        .gateway
        .hmac_secret
        .as_ref()
        .map(|secret| Arc::new(RequestSigner::new(secret.as_bytes().to_vec())))
}

async fn apply_security_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", "nosniff".parse().expect("static header"));
    headers.insert("X-Frame-Options", "DENY".parse().expect("static header"));
    headers.insert("X-XSS-Protection", "1; mode=block".parse().expect("static header"));
    headers.insert(
        "Strict-Transport-Security",
        "max-age=31536000; includeSubDomains".parse().expect("static header"),
    );
    response
}

async fn handle_health(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "security": { "request_signing": state.signer.is_some() },
    }))
}

async fn handle_messages(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    audit::log_request(&state.alias, method.as_str(), uri.path(), addr.ip(), &body);

    if !state.limiter.admit(addr.ip()).await {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "rate_limited"})),
        )
            .into_response();
    }

    if let Some(signer) = &state.signer {
        if let Err(failure) =
            validate_signed(signer, &state.nonces, &method, &uri, &headers, &body).await
        {
            tracing::warn!(
                alias = %state.alias,
                client = %addr.ip(),
                reason = failure.reason_code(),
                "gateway auth rejected"
            );
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": failure.reason_code()})),
            )
                .into_response();
        }
    }

    forward_upstream(&state, body).await
}

/// Validation order: timestamp window, then nonce single-use, then
/// constant-time signature compare.
async fn validate_signed(
    signer: &RequestSigner,
    nonces: &NonceStore,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AuthFailure> {
    let timestamp: u64 = header_str(headers, HEADER_TIMESTAMP)
        .and_then(|v| v.parse().ok())
        .ok_or(AuthFailure::BadSignature)?;
    if !auth::timestamp_in_window(auth::now_ms(), timestamp) {
        return Err(AuthFailure::ExpiredTimestamp);
    }

    let nonce = header_str(headers, HEADER_NONCE).ok_or(AuthFailure::BadSignature)?;
    nonces.check_and_insert(nonce).await?;

    let signature = header_str(headers, HEADER_SIGNATURE).ok_or(AuthFailure::BadSignature)?;
    signer.verify(method.as_str(), uri.path(), timestamp, nonce, body, signature)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Forward the completion payload upstream with the service's own
/// credentials; the alias's configured model id replaces whatever the caller
/// put in the payload. The upstream body comes back verbatim.
async fn forward_upstream(state: &GatewayState, body: Bytes) -> Response {
    let mut payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v @ serde_json::Value::Object(_)) => v,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "malformed_payload"})),
            )
                .into_response();
        }
    };
    payload["model"] = serde_json::Value::String(state.model_id.clone());

    let upstream = state
        .client
        .post(&state.upstream_url)
        .header("Authorization", format!("Bearer {}", state.upstream_api_key))
        .header("Content-Type", "application/json")
        .json(&payload)
        .send()
        .await;

    match upstream {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let bytes = response.bytes().await.unwrap_or_default();
            (status, [("Content-Type", "application/json")], bytes).into_response()
        }
        Err(e) => {
            tracing::warn!(alias = %state.alias, "upstream forward failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": "upstream_unreachable"})),
            )
                .into_response()
        }
    }
}
