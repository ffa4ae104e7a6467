use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Default window and budget for the per-IP limiter.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_REQUESTS: usize = 120;

/// Per-IP sliding-window rate limiter. A request is admitted when fewer than
/// `max_requests` timestamps fall inside the trailing window.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    inner: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_REQUESTS)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the request is admitted.
    pub async fn admit(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let hits = guard.entry(ip).or_default();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) > self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.max_requests {
            return false;
        }
        hits.push_back(now);
        true
    }
}
