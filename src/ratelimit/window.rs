//! Fixed rate limit windows and the decisions derived from them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ceil_secs;

/// Default sends admitted per window.
pub const DEFAULT_QUOTA: u32 = 2;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Quota and window length applied to every user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Maximum admitted sends per window
    pub quota: u32,
    /// Length of a window
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self { quota, window }
    }

    pub(crate) fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            quota: DEFAULT_QUOTA,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Send count for one user within one fixed window.
///
/// The window resets wholesale once it is a full window length old; there is
/// no sliding between windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    /// Sends recorded in the current window
    pub count: u32,
    /// When the window started, in clock milliseconds
    pub window_start_ms: u64,
}

impl RateWindow {
    /// Start an empty window at `now_ms`.
    pub fn fresh(now_ms: u64) -> Self {
        Self {
            count: 0,
            window_start_ms: now_ms,
        }
    }

    /// Milliseconds since the window started.
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.window_start_ms)
    }

    /// Whether the window is a full window length old.
    pub fn is_expired(&self, now_ms: u64, policy: &RateLimitPolicy) -> bool {
        self.elapsed_ms(now_ms) >= policy.window_millis()
    }

    /// This window, or a fresh one if it has expired.
    pub fn current(self, now_ms: u64, policy: &RateLimitPolicy) -> Self {
        if self.is_expired(now_ms, policy) {
            Self::fresh(now_ms)
        } else {
            self
        }
    }

    /// Time until the window rolls over.
    pub fn reset_in(&self, now_ms: u64, policy: &RateLimitPolicy) -> Duration {
        let left = policy.window_millis().saturating_sub(self.elapsed_ms(now_ms));
        Duration::from_millis(left)
    }

    /// The admit/reject decision this window implies.
    pub fn decision(&self, now_ms: u64, policy: &RateLimitPolicy) -> RateLimitDecision {
        RateLimitDecision {
            allowed: self.count < policy.quota,
            remaining: policy.quota.saturating_sub(self.count),
            reset_in: self.reset_in(now_ms, policy),
            limit: policy.quota,
        }
    }
}

/// Outcome of a rate limit check. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether another send would be admitted now
    pub allowed: bool,
    /// Sends still permitted in the current window
    pub remaining: u32,
    /// Time until the window rolls over
    pub reset_in: Duration,
    /// The configured quota
    pub limit: u32,
}

impl RateLimitDecision {
    /// Decision for a user with no recorded sends.
    pub fn full(policy: &RateLimitPolicy) -> Self {
        Self {
            allowed: policy.quota > 0,
            remaining: policy.quota,
            reset_in: policy.window,
            limit: policy.quota,
        }
    }

    /// Reset time rounded up to whole seconds.
    pub fn reset_in_secs(&self) -> u64 {
        ceil_secs(self.reset_in)
    }
}

/// Wire shape of a decision for status endpoints.
#[derive(Serialize)]
struct DecisionBody {
    allowed: bool,
    remaining: u32,
    #[serde(rename = "resetTime")]
    reset_time: u64,
    limit: u32,
}

impl Serialize for RateLimitDecision {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DecisionBody {
            allowed: self.allowed,
            remaining: self.remaining,
            reset_time: self.reset_in_secs(),
            limit: self.limit,
        }
        .serialize(serializer)
    }
}
