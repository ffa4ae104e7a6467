use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default upstream completion endpoint fronted by the gateway listeners.
const DEFAULT_UPSTREAM_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// First gateway listen port; alias kN listens on base + (N - 1),
/// the coordinator on base + 5.
const DEFAULT_GATEWAY_BASE_PORT: u16 = 3457;

/// How a model alias is reached.
#[derive(Clone)]
pub enum BackendKind {
    /// HTTP completion call, routed through this alias's gateway listener
    /// (or directly upstream when the gateway is disabled).
    Http,
    /// Per-alias launcher subprocess; the prompt is delivered via stdin.
    Launcher {
        executable: String,
        args_template: Vec<String>,
    },
}

/// Role an alias plays in a debate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AliasRole {
    Debater,
    Coordinator,
}

/// One entry of the immutable alias registry. The five debating aliases
/// (k1–k5) plus the dedicated coordinator are fixed for the process lifetime;
/// unknown aliases are a configuration error, never a runtime inference.
#[derive(Clone)]
pub struct AliasEntry {
    pub model_id: String,
    pub port: u16,
    pub role: AliasRole,
    pub cost_per_ktok: f64,
    pub speed_tier: &'static str,
    pub specialties: &'static [&'static str],
    pub backend: BackendKind,
}

impl std::fmt::Debug for AliasEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("AliasEntry");
        s.field("model_id", &self.model_id)
            .field("port", &self.port)
            .field("role", &self.role)
            .field("cost_per_ktok", &self.cost_per_ktok)
            .field("speed_tier", &self.speed_tier);
        match &self.backend {
            BackendKind::Http => {
                s.field("backend", &"http");
            }
            BackendKind::Launcher {
                executable,
                args_template,
            } => {
                s.field("backend", &"launcher")
                    .field("executable", executable)
                    .field("args_template", args_template);
            }
        }
        s.finish()
    }
}

#[derive(Clone, Debug)]
pub struct DebateSettings {
    /// Per-debate wall clock (DEBATE_TIMEOUT_MINUTES, default 30).
    pub timeout: Duration,
    /// Per-round fan-out deadline.
    pub round_deadline: Duration,
    /// Overrides preset max rounds when set (MAX_DEBATE_ITERATIONS).
    pub max_iterations_override: Option<usize>,
    /// Overrides preset consensus threshold when set (CONSENSUS_THRESHOLD).
    pub consensus_threshold_override: Option<f64>,
    /// Per-invocation model timeout.
    pub invocation_timeout: Duration,
}

impl Default for DebateSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            round_deadline: Duration::from_secs(10 * 60),
            max_iterations_override: None,
            consensus_threshold_override: None,
            invocation_timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub max_age: Duration,
    /// Optional JSON snapshot path (PARLEY_CACHE_PATH).
    pub persistence_path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_age: Duration::from_secs(24 * 60 * 60),
            persistence_path: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    /// Shared HMAC secret (HMAC_SECRET). Signing is disabled without it.
    pub hmac_secret: Option<String>,
    /// ENABLE_REQUEST_SIGNING — defaults to true when a secret is present.
    pub signing_enabled: bool,
    pub upstream_url: String,
    pub upstream_api_key: Option<String>,
}

pub struct Config {
    pub aliases: HashMap<String, AliasEntry>,
    pub coordinator_alias: String,
    pub retry: RetryPolicy,
    pub debate: DebateSettings,
    pub cache: CacheSettings,
    pub gateway: GatewaySettings,
    pub logs_dir: PathBuf,
    pub telemetry_disabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let base_port = env_parse("PARLEY_GATEWAY_BASE_PORT", DEFAULT_GATEWAY_BASE_PORT);

        let mut aliases = HashMap::new();

        // The five-alias taxonomy. Model ids follow the upstream's naming;
        // cost figures are per 1k tokens and feed preset cost estimates.
        aliases.insert(
            "k1".to_string(),
            AliasEntry {
                model_id: "anthropic/claude-sonnet-4".to_string(),
                port: base_port,
                role: AliasRole::Debater,
                cost_per_ktok: 0.003,
                speed_tier: "medium",
                specialties: &["architecture", "synthesis"],
                backend: launcher_or_http("k1"),
            },
        );
        aliases.insert(
            "k2".to_string(),
            AliasEntry {
                model_id: "google/gemini-2.5-flash".to_string(),
                port: base_port + 1,
                role: AliasRole::Debater,
                cost_per_ktok: 0.0006,
                speed_tier: "fast",
                specialties: &["breadth"],
                backend: launcher_or_http("k2"),
            },
        );
        aliases.insert(
            "k3".to_string(),
            AliasEntry {
                model_id: "deepseek/deepseek-chat".to_string(),
                port: base_port + 2,
                role: AliasRole::Debater,
                cost_per_ktok: 0.0002,
                speed_tier: "medium",
                specialties: &["logic"],
                backend: launcher_or_http("k3"),
            },
        );
        aliases.insert(
            "k4".to_string(),
            AliasEntry {
                model_id: "openai/gpt-4.1".to_string(),
                port: base_port + 3,
                role: AliasRole::Debater,
                cost_per_ktok: 0.002,
                speed_tier: "medium",
                specialties: &["analysis", "security"],
                backend: launcher_or_http("k4"),
            },
        );
        aliases.insert(
            "k5".to_string(),
            AliasEntry {
                model_id: "x-ai/grok-4".to_string(),
                port: base_port + 4,
                role: AliasRole::Debater,
                cost_per_ktok: 0.003,
                speed_tier: "slow",
                specialties: &["analysis", "security"],
                backend: launcher_or_http("k5"),
            },
        );
        // Dedicated coordinator: scores consensus, never debates, so no
        // roster can make it evaluate its own answer.
        aliases.insert(
            "coordinator".to_string(),
            AliasEntry {
                model_id: "anthropic/claude-sonnet-4".to_string(),
                port: base_port + 5,
                role: AliasRole::Coordinator,
                cost_per_ktok: 0.003,
                speed_tier: "medium",
                specialties: &[],
                backend: BackendKind::Http,
            },
        );

        let upstream_api_key = env::var("OPENROUTER_API_KEY")
            .or_else(|_| env::var("PARLEY_UPSTREAM_API_KEY"))
            .ok();
        if upstream_api_key.is_none() {
            tracing::warn!("no upstream API key set — gateway forwarding unavailable");
        }

        let hmac_secret = env::var("HMAC_SECRET").ok().filter(|s| !s.is_empty());
        let signing_enabled = match env::var("ENABLE_REQUEST_SIGNING").ok().as_deref() {
            Some("true") => true,
            Some("false") => false,
            _ => hmac_secret.is_some(),
        };
        if signing_enabled && hmac_secret.is_none() {
            tracing::warn!("ENABLE_REQUEST_SIGNING=true but HMAC_SECRET is empty — signing disabled");
        }

        let retry = RetryPolicy {
            max_retries: env_parse("MAX_RETRIES", 3usize),
            initial_delay: Duration::from_millis(env_parse("INITIAL_RETRY_DELAY", 1_000u64)),
            max_delay: Duration::from_millis(env_parse("MAX_RETRY_DELAY", 30_000u64)),
            multiplier: env_parse("BACKOFF_MULTIPLIER", 2.0f64),
        };

        let debate = DebateSettings {
            timeout: Duration::from_secs(env_parse("DEBATE_TIMEOUT_MINUTES", 30u64) * 60),
            max_iterations_override: env::var("MAX_DEBATE_ITERATIONS")
                .ok()
                .and_then(|v| v.parse().ok()),
            consensus_threshold_override: env::var("CONSENSUS_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok()),
            ..DebateSettings::default()
        };

        let cache = CacheSettings {
            max_entries: env_parse("PARLEY_CACHE_MAX_ENTRIES", 1_000usize),
            max_age: Duration::from_secs(env_parse("PARLEY_CACHE_MAX_AGE_SECS", 24 * 60 * 60)),
            persistence_path: env::var("PARLEY_CACHE_PATH").ok().map(PathBuf::from),
        };

        Config {
            aliases,
            coordinator_alias: "coordinator".to_string(),
            retry,
            debate,
            cache,
            gateway: GatewaySettings {
                signing_enabled: signing_enabled && hmac_secret.is_some(),
                hmac_secret,
                upstream_url: env::var("PARLEY_UPSTREAM_URL")
                    .unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string()),
                upstream_api_key,
            },
            logs_dir: env::var("PARLEY_LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs")),
            telemetry_disabled: env::var("TELEMETRY_DISABLED").ok().as_deref() == Some("true"),
        }
    }

    pub fn alias(&self, name: &str) -> Option<&AliasEntry> {
        self.aliases.get(name)
    }

    /// Debating aliases only, sorted by name for deterministic listings.
    pub fn debater_aliases(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .aliases
            .iter()
            .filter(|(_, e)| e.role == AliasRole::Debater)
            .map(|(k, _)| k.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Fastest debating alias (speed tier, then cost as tiebreak).
    pub fn fastest_alias(&self) -> &str {
        self.rank_debaters(|e| (speed_rank(e.speed_tier), ordered(e.cost_per_ktok)))
    }

    /// Cheapest debating alias.
    pub fn cheapest_alias(&self) -> &str {
        self.rank_debaters(|e| (ordered(e.cost_per_ktok), speed_rank(e.speed_tier)))
    }

    fn rank_debaters<K: Ord>(&self, key: impl Fn(&AliasEntry) -> K) -> &str {
        self.aliases
            .iter()
            .filter(|(_, e)| e.role == AliasRole::Debater)
            .min_by_key(|(name, e)| (key(e), name.as_str()))
            .map(|(name, _)| name.as_str())
            .unwrap_or("k1")
    }
}

fn speed_rank(tier: &str) -> u8 {
    match tier {
        "fast" => 0,
        "medium" => 1,
        _ => 2,
    }
}

/// Total order for cost values (NaN sorts last).
fn ordered(v: f64) -> u64 {
    let bits = v.to_bits();
    if v.is_nan() {
        u64::MAX
    } else if bits >> 63 == 0 {
        bits | (1 << 63)
    } else {
        !bits
    }
}

/// PARLEY_K<N>_LAUNCHER=/path/to/wrapper switches an alias to its launcher
/// backend; arguments beyond the executable come from
/// PARLEY_K<N>_LAUNCHER_ARGS (whitespace-separated).
fn launcher_or_http(alias: &str) -> BackendKind {
    let var = format!("PARLEY_{}_LAUNCHER", alias.to_uppercase());
    match env::var(&var) {
        Ok(executable) if !executable.trim().is_empty() => {
            let args_var = format!("{var}_ARGS");
            let args_template = env::var(&args_var)
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();
            BackendKind::Launcher {
                executable,
                args_template,
            }
        }
        _ => BackendKind::Http,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
