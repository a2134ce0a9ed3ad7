//! Storage for per-user rate windows.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::window::RateWindow;
use crate::error::Result;

/// Storage capability behind the rate limiter.
///
/// `compare_and_swap` is the only write the limiter relies on for
/// correctness; a networked implementation must make it atomic per key.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Fetch the window stored for a user.
    async fn get(&self, user_id: &str) -> Result<Option<RateWindow>>;

    /// Unconditionally store a window.
    async fn set(&self, user_id: &str, window: RateWindow) -> Result<()>;

    /// Store `new` only if the current value equals `expected` (`None` meaning absent).
    ///
    /// Returns `true` if the swap happened.
    async fn compare_and_swap(
        &self,
        user_id: &str,
        expected: Option<RateWindow>,
        new: RateWindow,
    ) -> Result<bool>;

    /// Remove every window that started at least `idle_after_ms` before `now_ms`.
    ///
    /// Returns the number of removed entries.
    async fn evict_idle(&self, now_ms: u64, idle_after_ms: u64) -> Result<usize>;

    /// Number of stored windows.
    async fn len(&self) -> Result<usize>;
}

/// Process-local store backed by `DashMap`.
///
/// State is lost on restart and is not shared between instances.
#[derive(Debug, Default)]
pub struct InMemoryRateStore {
    windows: DashMap<String, RateWindow>,
}

impl InMemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateStore {
    async fn get(&self, user_id: &str) -> Result<Option<RateWindow>> {
        Ok(self.windows.get(user_id).map(|w| *w))
    }

    async fn set(&self, user_id: &str, window: RateWindow) -> Result<()> {
        self.windows.insert(user_id.to_string(), window);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        user_id: &str,
        expected: Option<RateWindow>,
        new: RateWindow,
    ) -> Result<bool> {
        let swapped = match self.windows.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if expected == Some(*entry.get()) {
                    entry.insert(new);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(new);
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }

    async fn evict_idle(&self, now_ms: u64, idle_after_ms: u64) -> Result<usize> {
        let before = self.windows.len();
        self.windows
            .retain(|_, window| window.elapsed_ms(now_ms) < idle_after_ms);
        Ok(before.saturating_sub(self.windows.len()))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.windows.len())
    }
}
