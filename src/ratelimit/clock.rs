//! Time sources for rate limit windows.

use std::fmt::Debug;

/// Millisecond time source, so windows can be driven by tokio's paused clock in tests.
pub trait Clock: Send + Sync + Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock counting from its own creation.
///
/// Built on `tokio::time::Instant`, which follows the runtime's paused clock.
/// Values are only comparable within one process.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Wall clock in Unix milliseconds, for stores shared between processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}
