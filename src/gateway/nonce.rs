use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::sync::Mutex;

use crate::gateway::auth::AuthFailure;

/// Retention window — a nonce seen within this window is a replay.
pub const NONCE_TTL: Duration = Duration::from_secs(5 * 60);

/// Hard size bound; hitting it forces a sweep before the next insert.
pub const MAX_NONCES: usize = 50_000;

/// Interval of the background sweep task.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Single-use nonce registry shared by all gateway listeners.
///
/// One mutex covers probe + insert so check-then-record is atomic; the sweep
/// runs under the same lock. Expired entries are also pruned on every probe.
pub struct NonceStore {
    inner: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for NonceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceStore {
    pub fn new() -> Self {
        Self::with_limits(NONCE_TTL, MAX_NONCES)
    }

    pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Generate a fresh 128-bit nonce as 32 hex digits.
    pub fn generate() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Validate format, reject replays within the window, record otherwise.
    pub async fn check_and_insert(&self, nonce: &str) -> Result<(), AuthFailure> {
        if !is_well_formed(nonce) {
            return Err(AuthFailure::BadSignature);
        }

        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        Self::sweep_locked(&mut guard, now, self.ttl);

        if guard.contains_key(nonce) {
            return Err(AuthFailure::ReplayDetected);
        }
        if guard.len() >= self.max_entries {
            // Saturated even after the sweep — refuse rather than grow.
            tracing::warn!(len = guard.len(), "nonce store saturated, rejecting request");
            return Err(AuthFailure::ReplayDetected);
        }
        guard.insert(nonce.to_string(), now);
        Ok(())
    }

    /// Remove entries older than the retention window. Returns removed count.
    pub async fn sweep(&self) -> usize {
        let mut guard = self.inner.lock().await;
        Self::sweep_locked(&mut guard, Instant::now(), self.ttl)
    }

    fn sweep_locked(map: &mut HashMap<String, Instant>, now: Instant, ttl: Duration) -> usize {
        let before = map.len();
        map.retain(|_, inserted| now.duration_since(*inserted) <= ttl);
        before - map.len()
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Exactly 32 hex digits.
fn is_well_formed(nonce: &str) -> bool {
    nonce.len() == 32 && nonce.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Periodic sweep so idle listeners don't hold a window of dead nonces.
pub fn spawn_sweeper(store: Arc<NonceStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let removed = store.sweep().await;
            if removed > 0 {
                tracing::debug!(removed, "nonce sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonce_is_single_use() {
        let store = NonceStore::new();
        let nonce = NonceStore::generate();
        assert!(store.check_and_insert(&nonce).await.is_ok());
        assert_eq!(
            store.check_and_insert(&nonce).await,
            Err(AuthFailure::ReplayDetected)
        );
        assert_eq!(store.size().await, 1);
    }

    #[tokio::test]
    async fn malformed_nonces_rejected() {
        let store = NonceStore::new();
        let non_hex = "zz".repeat(16);
        let too_long = "a".repeat(33);
        for bad in ["", "short", non_hex.as_str(), too_long.as_str()] {
            assert_eq!(
                store.check_and_insert(bad).await,
                Err(AuthFailure::BadSignature),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn expired_entries_swept_on_probe() {
        let store = NonceStore::with_limits(Duration::from_millis(10), 10);
        let nonce = NonceStore::generate();
        assert!(store.check_and_insert(&nonce).await.is_ok());
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Window elapsed — the same nonce is acceptable again.
        assert!(store.check_and_insert(&nonce).await.is_ok());
        assert_eq!(store.size().await, 1);
    }

    #[tokio::test]
    async fn saturation_forces_sweep_then_rejects() {
        let store = NonceStore::with_limits(Duration::from_secs(300), 2);
        assert!(store.check_and_insert(&NonceStore::generate()).await.is_ok());
        assert!(store.check_and_insert(&NonceStore::generate()).await.is_ok());
        assert_eq!(
            store.check_and_insert(&NonceStore::generate()).await,
            Err(AuthFailure::ReplayDetected)
        );
    }
}
