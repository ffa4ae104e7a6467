use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("question too simple: {0}")]
    QuestionTooSimple(String),

    #[error("insufficient responses: {got} of {wanted} models produced an initial position")]
    InsufficientResponses { got: usize, wanted: usize },

    #[error("alias not found: {0}")]
    AliasNotFound(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("replay detected")]
    ReplayDetected,

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("launcher exited with code {code}: {stderr}")]
    LauncherExit { code: i32, stderr: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Internal(String),
}

impl ParleyError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Produce a sanitized error message safe for returning to MCP clients.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::QuestionTooSimple(reason) => format!("question too simple: {reason}"),
            Self::InsufficientResponses { got, wanted } => format!(
                "only {got} of {wanted} models produced an initial position — try a different preset"
            ),
            Self::AliasNotFound(alias) => format!("alias not found: {alias}"),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled(ms) => format!("request cancelled after {ms}ms"),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider} — try again shortly")
            }
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}")
            }
            Self::ReplayDetected => "replay detected".to_string(),
            Self::Upstream { provider, .. } => {
                format!("upstream error from {provider}")
            }
            Self::LauncherExit { code, .. } => {
                format!("launcher process exited with code {code}")
            }
            Self::Parse(_) => "failed to parse model response".to_string(),
            Self::Configuration(msg) => format!("configuration error: {msg}"),
            Self::Request(_) => "request to backend failed".to_string(),
            Self::Internal(_) => "an internal error occurred".to_string(),
        }
    }
}
