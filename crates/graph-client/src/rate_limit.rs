//! Client-side fixed-window rate limiter
//!
//! Per-key request counters over a fixed window. A counter resets only when
//! its whole window elapses; there is no token-bucket smoothing, so a burst
//! that exhausts the quota waits for the window boundary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use common::{Error, Result};
use tracing::debug;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_REQUESTS: u32 = 30;

struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window limiter. Interior mutability via a sync mutex; callers must
/// not hold the guard across an await (the public API never does).
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    windows: Mutex<HashMap<String, Window>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_REQUESTS)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for `key`.
    ///
    /// At or above the per-window maximum, returns `RateLimited` with the
    /// whole seconds until the window expires, rounded up (minimum 1).
    pub fn check(&self, key: &str) -> Result<()> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.duration_since(window.started) >= self.window {
            window.count = 0;
            window.started = now;
        }

        if window.count >= self.max_requests {
            let remaining = self
                .window
                .saturating_sub(now.duration_since(window.started));
            let mut retry_after_secs = remaining.as_secs();
            if remaining.subsec_nanos() > 0 {
                retry_after_secs += 1;
            }
            let retry_after_secs = retry_after_secs.max(1);
            debug!(key, count = window.count, retry_after_secs, "rate limit window exhausted");
            return Err(Error::RateLimited { retry_after_secs });
        }

        window.count += 1;
        Ok(())
    }
}
