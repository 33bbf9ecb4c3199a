//! Sliding-window rate limiting for plugin host calls.
//!
//! Each `(plugin, resource)` pair owns a window that starts at its first
//! call. Calls are admitted while the count is below the limit. Once the
//! window elapses the next call starts a fresh window with a count of one.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Configuration for a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum number of calls allowed in the window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimit {
    /// Create a new rate limit.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// N calls per second.
    #[must_use]
    pub fn per_second(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(1))
    }

    /// N calls per minute.
    #[must_use]
    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The call is admitted.
    Allowed {
        /// Calls left in the current window.
        remaining: u32,
        /// Time until the window resets.
        reset_in: Duration,
    },
    /// The call is refused.
    Denied {
        /// Time until the window resets.
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Whether the call is admitted.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Retry-after duration if denied.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed { .. } => None,
            Self::Denied { retry_after } => Some(*retry_after),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: u32,
    started: Instant,
}

/// Rate limiter keyed by `(plugin, resource)`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<(String, String), WindowState>,
}

impl RateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record one call at the current instant.
    pub fn check(&self, plugin: &str, resource: &str, limit: RateLimit) -> RateLimitResult {
        self.check_at(plugin, resource, limit, Instant::now())
    }

    /// Check and record one call at `now`.
    pub fn check_at(
        &self,
        plugin: &str,
        resource: &str,
        limit: RateLimit,
        now: Instant,
    ) -> RateLimitResult {
        let mut state = self
            .windows
            .entry((plugin.to_owned(), resource.to_owned()))
            .or_insert(WindowState {
                count: 0,
                started: now,
            });

        let elapsed = now.saturating_duration_since(state.started);
        if elapsed >= limit.window {
            state.count = 0;
            state.started = now;
        }
        let reset_in = limit
            .window
            .saturating_sub(now.saturating_duration_since(state.started));

        if state.count >= limit.max_requests {
            return RateLimitResult::Denied {
                retry_after: reset_in,
            };
        }

        state.count = state.count.saturating_add(1);
        RateLimitResult::Allowed {
            remaining: limit.max_requests.saturating_sub(state.count),
            reset_in,
        }
    }

    /// Calls recorded in the current window (zero if none or expired).
    #[must_use]
    pub fn current_count(&self, plugin: &str, resource: &str, limit: RateLimit) -> u32 {
        self.windows
            .get(&(plugin.to_owned(), resource.to_owned()))
            .filter(|s| Instant::now().saturating_duration_since(s.started) < limit.window)
            .map_or(0, |s| s.count)
    }

    /// Forget every window belonging to `plugin`.
    pub fn reset_plugin(&self, plugin: &str) {
        self.windows.retain(|(p, _), _| p != plugin);
    }

    /// Forget all windows.
    pub fn reset(&self) {
        self.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_creation() {
        let limit = RateLimit::per_minute(60);
        assert_eq!(limit.max_requests, 60);
        assert_eq!(limit.window, Duration::from_secs(60));
    }

    #[test]
    fn test_boundary_and_reset() {
        let limiter = RateLimiter::new();
        let limit = RateLimit::new(3, Duration::from_secs(10));
        let t0 = Instant::now();

        let results: Vec<bool> = (0..4)
            .map(|_| limiter.check_at("geo", "network", limit, t0).is_allowed())
            .collect();
        assert_eq!(results, vec![true, true, true, false]);

        let denied = limiter.check_at("geo", "network", limit, t0 + Duration::from_secs(4));
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(6)));

        let after = limiter.check_at("geo", "network", limit, t0 + Duration::from_secs(10));
        assert_eq!(
            after,
            RateLimitResult::Allowed {
                remaining: 2,
                reset_in: Duration::from_secs(10),
            }
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let limit = RateLimit::new(1, Duration::from_secs(60));
        assert!(limiter.check("geo", "network", limit).is_allowed());
        assert!(!limiter.check("geo", "network", limit).is_allowed());
        assert!(limiter.check("geo", "database", limit).is_allowed());
        assert!(limiter.check("charts", "network", limit).is_allowed());
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let limiter = RateLimiter::new();
        let limit = RateLimit::new(0, Duration::from_secs(60));
        assert!(!limiter.check("geo", "network", limit).is_allowed());
    }

    #[test]
    fn test_reset_plugin() {
        let limiter = RateLimiter::new();
        let limit = RateLimit::new(1, Duration::from_secs(60));
        assert!(limiter.check("geo", "network", limit).is_allowed());
        assert!(limiter.check("charts", "network", limit).is_allowed());
        limiter.reset_plugin("geo");
        assert_eq!(limiter.current_count("geo", "network", limit), 0);
        assert_eq!(limiter.current_count("charts", "network", limit), 1);
        assert!(limiter.check("geo", "network", limit).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_with_paused_clock() {
        let limiter = RateLimiter::new();
        let limit = RateLimit::new(2, Duration::from_secs(60));
        assert!(limiter.check("geo", "network", limit).is_allowed());
        assert!(limiter.check("geo", "network", limit).is_allowed());
        assert!(!limiter.check("geo", "network", limit).is_allowed());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("geo", "network", limit).is_allowed());
        assert_eq!(limiter.current_count("geo", "network", limit), 1);
    }
}
