use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::config::{AliasEntry, BackendKind, Config};
use crate::error::ParleyError;
use crate::gateway::auth::{RequestSigner, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::gateway::nonce::NonceStore;
use crate::retry::RetryHarness;

/// Cap on any single model response.
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// "Ask one model" — the single primitive the orchestrator and analyzer
/// consume. `None` means "this model did not contribute this round"; callers
/// continue with the remaining models. Implementations must depend only on
/// (alias, prompt, project_path) and hold no handle to the orchestrator.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn call_model(
        &self,
        alias: &str,
        prompt: &str,
        project_path: Option<&Path>,
    ) -> Option<String>;
}

/// Production invoker: routes HTTP aliases through their signed gateway
/// listener and launcher aliases through a subprocess, with the retry
/// harness wrapped around retriable failures.
pub struct DispatchInvoker {
    config: Arc<Config>,
    harness: Arc<RetryHarness>,
    signer: Option<Arc<RequestSigner>>,
    client: reqwest::Client,
}

/// Minimal completion-response shape shared by OpenAI-compatible upstreams.
#[derive(Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

impl DispatchInvoker {
    pub fn new(
        config: Arc<Config>,
        harness: Arc<RetryHarness>,
        signer: Option<Arc<RequestSigner>>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");
        Self {
            config,
            harness,
            signer,
            client,
        }
    }

    async fn dispatch(
        &self,
        alias: &str,
        entry: &AliasEntry,
        prompt: &str,
        project_path: Option<&Path>,
        deadline: Instant,
    ) -> Result<String, ParleyError> {
        match &entry.backend {
            BackendKind::Http => self.http_call(alias, entry, prompt, deadline).await,
            BackendKind::Launcher {
                executable,
                args_template,
            } => {
                launcher_call(alias, executable, args_template, prompt, project_path, deadline).await
            }
        }
    }

    /// HTTP completion through this alias's gateway listener. When signing is
    /// enabled the exact body bytes are signed; the gateway re-validates.
    async fn http_call(
        &self,
        alias: &str,
        entry: &AliasEntry,
        prompt: &str,
        deadline: Instant,
    ) -> Result<String, ParleyError> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| *d > Duration::from_millis(100))
            .ok_or(ParleyError::Timeout(0))?;

        let url = format!("http://127.0.0.1:{}/v1/messages", entry.port);
        let body = serde_json::json!({
            "model": entry.model_id,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| ParleyError::Internal(format!("payload serialization: {e}")))?;

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(remaining);

        if let Some(signer) = &self.signer {
            let timestamp = crate::gateway::auth::now_ms();
            let nonce = NonceStore::generate();
            let signature = signer.sign("POST", "/v1/messages", timestamp, &nonce, &body_bytes);
            request = request
                .header(HEADER_TIMESTAMP, timestamp.to_string())
                .header(HEADER_NONCE, nonce)
                .header(HEADER_SIGNATURE, signature);
        }

        let start = Instant::now();
        let response = request.body(body_bytes).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ParleyError::RateLimited {
                provider: alias.to_string(),
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ParleyError::AuthFailed {
                provider: alias.to_string(),
                message: format!("{status}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(500).collect();
            return Err(ParleyError::Upstream {
                provider: alias.to_string(),
                message: format!("{status}: {truncated}"),
                status: Some(status.as_u16()),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(ParleyError::Upstream {
                provider: alias.to_string(),
                message: format!("response too large: {}B", bytes.len()),
                status: None,
            });
        }
        tracing::debug!(
            alias,
            elapsed_ms = start.elapsed().as_millis() as u64,
            bytes = bytes.len(),
            "completion received"
        );

        let parsed: CompletionBody = serde_json::from_slice(&bytes)
            .map_err(|e| ParleyError::Parse(format!("malformed completion body: {e}")))?;
        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ParleyError::Parse("empty response".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl ModelInvoker for DispatchInvoker {
    async fn call_model(
        &self,
        alias: &str,
        prompt: &str,
        project_path: Option<&Path>,
    ) -> Option<String> {
        let entry = match self.config.alias(alias) {
            Some(entry) => entry.clone(),
            None => {
                tracing::error!(alias, "call_model on unknown alias");
                return None;
            }
        };
        let deadline = Instant::now() + self.config.debate.invocation_timeout;

        let result = self
            .harness
            .execute(|| self.dispatch(alias, &entry, prompt, project_path, deadline))
            .await;

        match result {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(
                    alias,
                    kind = e.kind.as_str(),
                    attempts = e.attempts,
                    "model did not contribute: {}",
                    e.source.user_message()
                );
                None
            }
        }
    }
}

/// Drop guard that kills the entire process group (not just the leader PID).
///
/// `kill_on_drop(true)` only signals the child PID; a launcher that spawns
/// grandchildren would leave them orphaned. The guard signals the negative
/// PID, covering the whole group.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
}

/// Run the per-alias launcher: prompt via stdin (argv would hit ARG_MAX),
/// stdout capped, whole process group killed on timeout.
async fn launcher_call(
    alias: &str,
    executable: &str,
    args_template: &[String],
    prompt: &str,
    project_path: Option<&Path>,
    deadline: Instant,
) -> Result<String, ParleyError> {
    let timeout = deadline
        .checked_duration_since(Instant::now())
        .filter(|d| *d > Duration::from_millis(100))
        .ok_or(ParleyError::Timeout(0))?;

    let mut cmd = Command::new(executable);
    cmd.args(args_template)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .process_group(0);
    if let Some(dir) = project_path {
        cmd.current_dir(dir);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ParleyError::Configuration(format!("launcher not found: {executable}"))
        } else {
            ParleyError::Internal(format!("launcher spawn failed: {e}"))
        }
    })?;
    let mut guard = ProcessGroupGuard::new(child.id());

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| ParleyError::Internal(format!("launcher stdin write failed: {e}")))?;
        drop(stdin);
    }

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain both pipes concurrently so a chatty stderr can't wedge stdout.
    let outcome = tokio::time::timeout(timeout, async {
        let read_out = async {
            let mut out = Vec::new();
            if let Some(ref mut pipe) = stdout {
                let mut limited = pipe.take((MAX_RESPONSE_BYTES + 1) as u64);
                limited.read_to_end(&mut out).await.ok();
            }
            out
        };
        let read_err = async {
            let mut err = Vec::new();
            if let Some(ref mut pipe) = stderr {
                let mut limited = pipe.take(64 * 1024);
                limited.read_to_end(&mut err).await.ok();
            }
            err
        };
        let (out, err) = tokio::join!(read_out, read_err);
        let status = child.wait().await;
        (out, err, status)
    })
    .await;

    let (stdout_bytes, stderr_bytes, status) = match outcome {
        Ok(v) => v,
        Err(_) => {
            // Guard fires on drop and reaps the whole group.
            return Err(ParleyError::Timeout(start.elapsed().as_millis() as u64));
        }
    };
    guard.disarm();

    let status = status.map_err(|e| ParleyError::Internal(format!("launcher wait failed: {e}")))?;
    if !status.success() {
        let code = status.code().unwrap_or(-1);
        let stderr_text: String = String::from_utf8_lossy(&stderr_bytes)
            .chars()
            .take(500)
            .collect();
        return Err(ParleyError::LauncherExit {
            code,
            stderr: stderr_text,
        });
    }

    if stdout_bytes.len() > MAX_RESPONSE_BYTES {
        return Err(ParleyError::Upstream {
            provider: alias.to_string(),
            message: format!("launcher output too large: >{MAX_RESPONSE_BYTES}B"),
            status: None,
        });
    }
    let text = String::from_utf8_lossy(&stdout_bytes).trim().to_string();
    if text.is_empty() {
        return Err(ParleyError::Parse("empty launcher output".to_string()));
    }
    Ok(text)
}
