use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::redact::redact;

/// Uniqueness suffix for artifacts written within the same millisecond.
static ARTIFACT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Best-effort writer for per-debate JSON artifacts. Failures are logged and
/// swallowed; a debate never fails because its log could not be written.
/// Writes are serialized per writer so round artifacts land in order.
pub struct ArtifactWriter {
    logs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ArtifactWriter {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self {
            logs_dir,
            write_lock: Mutex::new(()),
        }
    }

    /// `iterative_debate_intermediate_<round>_<ts>.json` after each
    /// evaluation.
    pub async fn write_intermediate(&self, round: usize, payload: &serde_json::Value) {
        let name = format!(
            "iterative_debate_intermediate_{round}_{}.json",
            stamp_suffix()
        );
        self.write(&name, payload).await;
    }

    /// `iterative_debate_<ts>.json` once, at the debate's terminal state.
    pub async fn write_final(&self, payload: &serde_json::Value) {
        let name = format!("iterative_debate_{}.json", stamp_suffix());
        self.write(&name, payload).await;
    }

    async fn write(&self, name: &str, payload: &serde_json::Value) {
        let _guard = self.write_lock.lock().await;

        if let Err(e) = tokio::fs::create_dir_all(&self.logs_dir).await {
            tracing::warn!(dir = %self.logs_dir.display(), "logs dir unavailable: {e}");
            return;
        }
        let json = match serde_json::to_string_pretty(payload) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("artifact serialization failed: {e}");
                return;
            }
        };
        let json = redact(&json);

        let path = self.logs_dir.join(name);
        // Atomic write: temp file + rename prevents partial reads.
        let tmp = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            tracing::warn!(path = %path.display(), "artifact write failed: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            tracing::warn!(path = %path.display(), "artifact rename failed: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }
}

fn stamp_suffix() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = ARTIFACT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{ts}_{seq}")
}

/// Running per-category success counts, persisted at
/// `logs/confidence-history.json`. Feeds the history factor of the
/// confidence score.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfidenceHistory {
    #[serde(default)]
    categories: std::collections::HashMap<String, CategoryRecord>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub successes: u64,
    pub total: u64,
}

pub struct ConfidenceTracker {
    path: PathBuf,
    state: Mutex<ConfidenceHistory>,
}

impl ConfidenceTracker {
    pub async fn open(logs_dir: &std::path::Path) -> Self {
        let path = logs_dir.join("confidence-history.json");
        let state = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => ConfidenceHistory::default(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Historical success rate for a category, if any debates were recorded.
    pub async fn success_rate(&self, category: &str) -> Option<f64> {
        let state = self.state.lock().await;
        state
            .categories
            .get(category)
            .filter(|r| r.total > 0)
            .map(|r| r.successes as f64 / r.total as f64)
    }

    /// Record one debate outcome and persist. Errors never propagate.
    pub async fn record(&self, category: &str, success: bool) {
        let snapshot = {
            let mut state = self.state.lock().await;
            let record = state.categories.entry(category.to_string()).or_default();
            record.total += 1;
            if success {
                record.successes += 1;
            }
            serde_json::to_string_pretty(&*state).ok()
        };
        let Some(json) = snapshot else { return };

        if let Some(parent) = self.path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!("confidence history dir unavailable: {e}");
            return;
        }
        if let Err(e) = tokio::fs::write(&self.path, json.as_bytes()).await {
            tracing::warn!(path = %self.path.display(), "confidence history write failed: {e}");
        }
    }
}
