//! Rate Limiting for outbound commands
//!
//! Fixed-window admission control: one window per caller identifier plus
//! one global window shared by every caller.
//!
//! Features:
//! - Per-caller request limits
//! - Global limit across callers
//! - Both counters move together under one lock
//! - Cleanup of expired windows

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::clock::{self, SharedClock};
use crate::error::{CoreError, Result};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per caller per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
    /// Enable the global limit
    pub enable_global_limit: bool,
    /// Global limit (requests per window across all callers)
    pub global_max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,               // 100 requests
            window: Duration::from_secs(60), // per minute
            enable_global_limit: true,
            global_max_requests: 1000, // 1000 total per minute
        }
    }
}

/// One fixed window
#[derive(Debug, Clone)]
struct RateWindow {
    count: u32,
    resets_at: Instant,
}

impl RateWindow {
    fn new(now: Instant, length: Duration) -> Self {
        Self {
            count: 0,
            resets_at: now + length,
        }
    }

    /// Start a new window if the current one ended
    fn roll(&mut self, now: Instant, length: Duration) {
        if now >= self.resets_at {
            self.count = 0;
            self.resets_at = now + length;
        }
    }

    fn retry_after(&self, now: Instant) -> Duration {
        self.resets_at.saturating_duration_since(now)
    }
}

struct Windows {
    callers: HashMap<String, RateWindow>,
    global: RateWindow,
}

/// Admission granted by [`RateLimiter::check_and_consume`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Remaining requests for this caller in the window
    pub remaining: u32,
    /// Time until the caller's window resets
    pub reset_after: Duration,
}

/// Rate limit statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub tracked_callers: usize,
    pub global_requests_in_window: u32,
    pub rejected_local: u64,
    pub rejected_global: u64,
}

/// Per-caller and global fixed-window limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    windows: Mutex<Windows>,
    rejected_local: AtomicU64,
    rejected_global: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: RateLimitConfig, clock: SharedClock) -> Self {
        let global = RateWindow::new(clock.now(), config.window);
        Self {
            config,
            clock,
            windows: Mutex::new(Windows {
                callers: HashMap::new(),
                global,
            }),
            rejected_local: AtomicU64::new(0),
            rejected_global: AtomicU64::new(0),
        }
    }

    /// Admit one request from `identifier`, consuming from both windows.
    ///
    /// The caller's window is checked first. A rejected request consumes
    /// nothing.
    pub fn check_and_consume(&self, identifier: &str) -> Result<RateLimitStatus> {
        let now = self.clock.now();
        let length = self.config.window;
        let mut windows = self.windows.lock();
        let Windows { callers, global } = &mut *windows;

        let caller = callers
            .entry(identifier.to_string())
            .or_insert_with(|| RateWindow::new(now, length));
        caller.roll(now, length);

        if caller.count >= self.config.max_requests {
            self.rejected_local.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Caller {} rate limited ({} requests in window)",
                identifier, caller.count
            );
            return Err(CoreError::LocalLimitExceeded {
                identifier: identifier.to_string(),
                retry_after: caller.retry_after(now),
            });
        }

        if self.config.enable_global_limit {
            global.roll(now, length);
            if global.count >= self.config.global_max_requests {
                self.rejected_global.fetch_add(1, Ordering::Relaxed);
                warn!("Global rate limit hit ({} requests)", global.count);
                return Err(CoreError::GlobalLimitExceeded {
                    retry_after: global.retry_after(now),
                });
            }
            global.count += 1;
        }
        caller.count += 1;

        let remaining = self.config.max_requests - caller.count;
        debug!("Caller {} allowed ({} remaining)", identifier, remaining);
        Ok(RateLimitStatus {
            remaining,
            reset_after: caller.retry_after(now),
        })
    }

    /// Drop windows that have ended; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let before = windows.callers.len();
        windows.callers.retain(|_, window| window.resets_at > now);
        before - windows.callers.len()
    }

    /// Get current stats
    pub fn stats(&self) -> RateLimitStats {
        let now = self.clock.now();
        let windows = self.windows.lock();
        let global_requests_in_window = if windows.global.resets_at > now {
            windows.global.count
        } else {
            0
        };

        RateLimitStats {
            tracked_callers: windows.callers.len(),
            global_requests_in_window,
            rejected_local: self.rejected_local.load(Ordering::Relaxed),
            rejected_global: self.rejected_global.load(Ordering::Relaxed),
        }
    }
}
