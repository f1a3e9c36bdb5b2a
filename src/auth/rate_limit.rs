#![forbid(unsafe_code)]

// Per-address handshake rate limiting: a sliding window over authentication
// attempts, kept in process memory so the relay owns its own limiter state.
// The clock is injected so tests can drive time directly.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Monotonic time source. Swapped for a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Sliding-window limiter over handshake authentication attempts.
/// Every call to [`AuthRateLimiter::check`] counts as an attempt, whether or
/// not the token later verifies.
pub struct AuthRateLimiter {
    max_attempts: u32,
    window: Duration,
    attempts: RwLock<HashMap<IpAddr, Vec<Instant>>>,
    clock: Box<dyn Clock>,
}

impl AuthRateLimiter {
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self::with_clock(max_attempts, window, Box::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(max_attempts: u32, window: Duration, clock: Box<dyn Clock>) -> Self {
        Self {
            max_attempts,
            window,
            attempts: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Records an attempt from `addr` and reports whether it is allowed.
    pub fn check(&self, addr: IpAddr) -> bool {
        let now = self.clock.now();
        let mut attempts = self.attempts.write().unwrap_or_else(|e| e.into_inner());

        let entry = attempts.entry(addr).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max_attempts as usize {
            return false;
        }
        entry.push(now);
        true
    }

    /// Drops addresses whose every attempt has aged out of the window.
    /// Called opportunistically from the sweep task.
    pub fn prune(&self) {
        let now = self.clock.now();
        let mut attempts = self.attempts.write().unwrap_or_else(|e| e.into_inner());
        attempts.retain(|_, entries| {
            entries.retain(|t| now.duration_since(*t) < self.window);
            !entries.is_empty()
        });
    }

    #[must_use]
    pub fn tracked_addresses(&self) -> usize {
        self.attempts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW)
    }
}
