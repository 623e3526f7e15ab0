//! Tumbling-window limiter for the external API budget.
//!
//! All counters reset together when the window is 60 seconds old, so burst
//! capacity is available again immediately after a rollover.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ApiRateLimitConfig;

/// Length of one rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Result of a quota request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaGrant {
    /// Amount asked for.
    pub requested: u64,
    /// Amount granted; may be anything from zero to `requested`.
    pub granted: u64,
    /// Whether the grant came from the burst allowance.
    pub from_burst: bool,
}

impl QuotaGrant {
    /// True when less than the requested amount was granted.
    pub fn is_partial(&self) -> bool {
        self.granted < self.requested
    }
}

/// Emitted once per window when burst usage goes past the burst limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleNotice {
    pub requests_this_window: u64,
    pub burst_used: u64,
    pub burst_limit: u64,
}

/// Point-in-time view of the current window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitSnapshot {
    pub requests_this_window: u64,
    pub remaining: u64,
    pub burst_used: u64,
    pub burst_limit: u64,
    pub utilization_percent: f64,
}

#[derive(Debug)]
struct RateLimiterWindow {
    request_count: u64,
    window_start: Instant,
    burst_used: u64,
    throttled: bool,
}

impl RateLimiterWindow {
    fn starting_at(now: Instant) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            burst_used: 0,
            throttled: false,
        }
    }
}

/// API budget tracker. Callers serialize access; the pool keeps it behind
/// a mutex.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: u64,
    burst_limit: u64,
    window: RateLimiterWindow,
}

impl RateLimiter {
    pub fn new(config: &ApiRateLimitConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    pub(crate) fn starting_at(config: &ApiRateLimitConfig, now: Instant) -> Self {
        Self {
            requests_per_minute: config.requests_per_minute,
            burst_limit: config.burst_limit,
            window: RateLimiterWindow::starting_at(now),
        }
    }

    /// Computes how much of `requested` may be used right now. Does not
    /// consume anything; usage is charged by [`RateLimiter::record`].
    pub fn grant(&mut self, requested: u64) -> QuotaGrant {
        self.grant_at(requested, Instant::now())
    }

    /// Charges `count` requests against the window.
    pub fn record(&mut self, count: u64) -> Option<ThrottleNotice> {
        self.record_at(count, Instant::now())
    }

    pub fn snapshot(&mut self) -> RateLimitSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn grant_at(&mut self, requested: u64, now: Instant) -> QuotaGrant {
        self.roll(now);

        let remaining = self
            .requests_per_minute
            .saturating_sub(self.window.request_count);
        if remaining > 0 {
            return QuotaGrant {
                requested,
                granted: requested.min(remaining),
                from_burst: false,
            };
        }

        let burst_left = self.burst_limit.saturating_sub(self.window.burst_used);
        QuotaGrant {
            requested,
            granted: requested.min(burst_left),
            from_burst: true,
        }
    }

    pub(crate) fn record_at(&mut self, count: u64, now: Instant) -> Option<ThrottleNotice> {
        self.roll(now);

        let window = &mut self.window;
        window.request_count = window.request_count.saturating_add(count);
        window.burst_used = window
            .request_count
            .saturating_sub(self.requests_per_minute);

        if window.burst_used > self.burst_limit && !window.throttled {
            window.throttled = true;
            return Some(ThrottleNotice {
                requests_this_window: window.request_count,
                burst_used: window.burst_used,
                burst_limit: self.burst_limit,
            });
        }

        None
    }

    pub(crate) fn snapshot_at(&mut self, now: Instant) -> RateLimitSnapshot {
        self.roll(now);

        let used = self.window.request_count;
        let utilization_percent = if self.requests_per_minute == 0 {
            0.0
        } else {
            used as f64 / self.requests_per_minute as f64 * 100.0
        };

        RateLimitSnapshot {
            requests_this_window: used,
            remaining: self.requests_per_minute.saturating_sub(used),
            burst_used: self.window.burst_used,
            burst_limit: self.burst_limit,
            utilization_percent,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window.window_start) >= RATE_WINDOW {
            self.window = RateLimiterWindow::starting_at(now);
        }
    }
}
