pub mod fingerprint;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::cache::fingerprint::{debate_fingerprint, project_fingerprint, UNKNOWN_PROJECT};
use crate::config::CacheSettings;

/// Entries below this confidence are soft-invalidated on read.
pub const MIN_CONFIDENCE: f64 = 0.7;

/// Pinned cost model: tokens ≈ ceil(serialized length / 4),
/// cost = tokens × $0.00002.
const COST_PER_TOKEN: f64 = 0.000_02;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub result: serde_json::Value,
    /// Epoch milliseconds.
    pub stored_at: u64,
    pub confidence: f64,
    pub token_count: u64,
    pub estimated_cost: f64,
    pub project_fingerprint: String,
    pub category: String,
}

/// Probe-time context for one question.
#[derive(Debug, Clone)]
pub struct CacheContext {
    pub category: String,
    pub roster_aliases: Vec<String>,
    pub project_fingerprint: String,
    pub bypass: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
    pub avg_response_time_ms: ResponseTimes,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseTimes {
    pub cached: f64,
    pub fresh: f64,
}

/// Fingerprint-addressed store of prior debate outcomes.
///
/// Readers share the map; writers take it exclusively per operation, so there
/// is one writer per fingerprint at a time. Snapshot persistence is
/// serialized globally by its own mutex and never fails the caller.
pub struct FingerprintCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
    max_age: Duration,
    persistence_path: Option<PathBuf>,
    persist_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
    cached_ms_sum: AtomicU64,
    cached_ms_count: AtomicU64,
    fresh_ms_sum: AtomicU64,
    fresh_ms_count: AtomicU64,
    memory_bytes: AtomicU64,
}

impl FingerprintCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: settings.max_entries,
            max_age: settings.max_age,
            persistence_path: settings.persistence_path.clone(),
            persist_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            cached_ms_sum: AtomicU64::new(0),
            cached_ms_count: AtomicU64::new(0),
            fresh_ms_sum: AtomicU64::new(0),
            fresh_ms_count: AtomicU64::new(0),
            memory_bytes: AtomicU64::new(0),
        }
    }

    /// Load a persisted snapshot, discarding entries past `max_age`.
    /// Persistence errors are logged and swallowed.
    pub async fn load(&self) {
        let Some(path) = &self.persistence_path else {
            return;
        };
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(path = %path.display(), "cache snapshot unreadable: {e}");
                return;
            }
        };
        let snapshot: Vec<CacheEntry> = match serde_json::from_slice(&raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(path = %path.display(), "cache snapshot malformed: {e}");
                return;
            }
        };

        let now = now_ms();
        let max_age_ms = self.max_age.as_millis() as u64;
        let mut map = self.entries.write().await;
        let mut bytes = 0u64;
        for entry in snapshot {
            if now.saturating_sub(entry.stored_at) > max_age_ms {
                continue;
            }
            bytes += entry_weight(&entry);
            map.insert(entry.fingerprint.clone(), entry);
        }
        self.memory_bytes.store(bytes, Ordering::Relaxed);
        tracing::info!(entries = map.len(), "cache snapshot loaded");
    }

    /// Look up a prior result. Expired or low-confidence entries are removed
    /// on the way out; project drift and explicit bypass also miss.
    pub async fn probe(&self, question: &str, ctx: &CacheContext) -> Option<CacheEntry> {
        if ctx.bypass || ctx.project_fingerprint == UNKNOWN_PROJECT {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let key = debate_fingerprint(
            question,
            &ctx.category,
            &ctx.roster_aliases,
            &ctx.project_fingerprint,
        );

        let found = {
            let map = self.entries.read().await;
            map.get(&key).cloned()
        };
        let Some(entry) = found else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let age_ms = now_ms().saturating_sub(entry.stored_at);
        let expired = age_ms > self.max_age.as_millis() as u64;
        let weak = entry.confidence < MIN_CONFIDENCE;
        let drifted = entry.project_fingerprint != ctx.project_fingerprint;

        if expired || weak || drifted {
            let mut map = self.entries.write().await;
            if let Some(dead) = map.remove(&key) {
                sub_saturating(&self.memory_bytes, entry_weight(&dead));
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store a debate result. Evicts the oldest entry (smallest `stored_at`)
    /// when the map is full — one eviction per store.
    pub async fn store(
        &self,
        question: &str,
        result: serde_json::Value,
        confidence: f64,
        ctx: &CacheContext,
    ) -> CacheEntry {
        let key = debate_fingerprint(
            question,
            &ctx.category,
            &ctx.roster_aliases,
            &ctx.project_fingerprint,
        );
        let serialized_len = serde_json::to_string(&result).map(|s| s.len()).unwrap_or(0);
        let token_count = serialized_len.div_ceil(4) as u64;
        let entry = CacheEntry {
            fingerprint: key.clone(),
            result,
            stored_at: now_ms(),
            confidence: confidence.clamp(0.0, 1.0),
            token_count,
            estimated_cost: token_count as f64 * COST_PER_TOKEN,
            project_fingerprint: ctx.project_fingerprint.clone(),
            category: ctx.category.clone(),
        };

        {
            let mut map = self.entries.write().await;
            if map.len() >= self.max_entries && !map.contains_key(&key) {
                if let Some(oldest) = map
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(k, _)| k.clone())
                    && let Some(evicted) = map.remove(&oldest)
                {
                    sub_saturating(&self.memory_bytes, entry_weight(&evicted));
                }
            }
            if let Some(previous) = map.insert(key, entry.clone()) {
                sub_saturating(&self.memory_bytes, entry_weight(&previous));
            }
            self.memory_bytes.fetch_add(entry_weight(&entry), Ordering::Relaxed);
        }
        self.stores.fetch_add(1, Ordering::Relaxed);

        self.persist().await;
        entry
    }

    pub async fn invalidate_by_category(&self, category: &str) -> usize {
        self.invalidate_where(|e| e.category == category).await
    }

    /// Remove entries whose category or fingerprint matches the pattern.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, regex::Error> {
        let re = regex::Regex::new(pattern)?;
        Ok(self
            .invalidate_where(|e| re.is_match(&e.category) || re.is_match(&e.fingerprint))
            .await)
    }

    /// Recompute the project fingerprint and drop entries that no longer
    /// match it.
    pub async fn invalidate_by_context(&self, project_path: &Path) -> usize {
        let current = project_fingerprint(project_path).await;
        self.invalidate_where(|e| e.project_fingerprint != current)
            .await
    }

    async fn invalidate_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut map = self.entries.write().await;
        let before = map.len();
        let mut freed = 0u64;
        map.retain(|_, entry| {
            if predicate(entry) {
                freed += entry_weight(entry);
                false
            } else {
                true
            }
        });
        let removed = before - map.len();
        drop(map);

        sub_saturating(&self.memory_bytes, freed);
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    pub fn record_response_time(&self, cached: bool, elapsed_ms: u64) {
        if cached {
            self.cached_ms_sum.fetch_add(elapsed_ms, Ordering::Relaxed);
            self.cached_ms_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fresh_ms_sum.fetch_add(elapsed_ms, Ordering::Relaxed);
            self.fresh_ms_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let probes = hits + misses;
        CacheStats {
            entries,
            hits,
            misses,
            stores: self.stores.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if probes == 0 {
                0.0
            } else {
                hits as f64 / probes as f64
            },
            avg_response_time_ms: ResponseTimes {
                cached: avg(
                    self.cached_ms_sum.load(Ordering::Relaxed),
                    self.cached_ms_count.load(Ordering::Relaxed),
                ),
                fresh: avg(
                    self.fresh_ms_sum.load(Ordering::Relaxed),
                    self.fresh_ms_count.load(Ordering::Relaxed),
                ),
            },
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
        }
    }

    /// Write the whole cache as JSON. Serialized globally; errors never
    /// propagate.
    async fn persist(&self) {
        let Some(path) = &self.persistence_path else {
            return;
        };
        let _guard = self.persist_lock.lock().await;

        let snapshot: Vec<CacheEntry> = {
            let map = self.entries.read().await;
            map.values().cloned().collect()
        };
        let json = match serde_json::to_string(&snapshot) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("cache snapshot serialization failed: {e}");
                return;
            }
        };

        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(path = %path.display(), "cache snapshot dir unavailable: {e}");
            return;
        }
        // Atomic write: temp file + rename prevents partial reads.
        let tmp = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            tracing::warn!(path = %path.display(), "cache snapshot write failed: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            tracing::warn!(path = %path.display(), "cache snapshot rename failed: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn sub_saturating(counter: &AtomicU64, amount: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(amount))
    });
}

fn avg(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

/// Rough per-entry memory weight for the stats report.
fn entry_weight(entry: &CacheEntry) -> u64 {
    let result_len = serde_json::to_string(&entry.result)
        .map(|s| s.len())
        .unwrap_or(0);
    (result_len + entry.fingerprint.len() + entry.project_fingerprint.len() + entry.category.len())
        as u64
        + 96
}
