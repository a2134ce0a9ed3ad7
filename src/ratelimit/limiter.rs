//! Per-user fixed-window send limiter.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::clock::{Clock, MonotonicClock};
use super::store::{InMemoryRateStore, RateLimitStore};
use super::window::{RateLimitDecision, RateLimitPolicy, RateWindow};
use crate::error::{Result, SendgateError};

/// Upper bound on compare-and-swap retries for one operation.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Windows idle for this many window lengths are reaped.
const IDLE_WINDOWS_BEFORE_REAP: u64 = 2;

/// The rate limiter that tracks sends per user.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
pub struct RateLimiter {
    /// Backing store for rate windows
    store: Arc<dyn RateLimitStore>,
    /// Time source for window arithmetic
    clock: Arc<dyn Clock>,
    /// Quota and window length
    policy: RateLimitPolicy,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .finish()
    }
}

impl RateLimiter {
    /// Create an in-memory rate limiter with the given policy.
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_store(
            policy,
            Arc::new(InMemoryRateStore::new()),
            Arc::new(MonotonicClock::new()),
        )
    }

    /// Create a rate limiter over an explicit store and clock.
    pub fn with_store(
        policy: RateLimitPolicy,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// Check whether `user_id` may send now, without recording a send.
    ///
    /// Creates the user's window on first use and rolls it over when expired.
    pub async fn check(&self, user_id: &str) -> Result<RateLimitDecision> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let stored = self.store.get(user_id).await?;
            let current = match stored {
                Some(window) => window.current(now, &self.policy),
                None => RateWindow::fresh(now),
            };

            if stored != Some(current) {
                if !self.store.compare_and_swap(user_id, stored, current).await? {
                    continue;
                }
                debug!(
                    user_id = %user_id,
                    quota = self.policy.quota,
                    window_secs = self.policy.window.as_secs(),
                    "Started new rate window"
                );
            }

            let decision = current.decision(now, &self.policy);
            if !decision.allowed {
                warn!(
                    user_id = %user_id,
                    reset_in_secs = decision.reset_in_secs(),
                    "Email rate limit exceeded"
                );
            } else {
                trace!(user_id = %user_id, remaining = decision.remaining, "Rate limit checked");
            }
            return Ok(decision);
        }

        Err(self.contention(user_id))
    }

    /// Record one send for `user_id` in its current window.
    ///
    /// Does nothing if the user has never been checked. A send landing after
    /// the window expired is attributed to a fresh window.
    pub async fn increment(&self, user_id: &str) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let Some(stored) = self.store.get(user_id).await? else {
                trace!(user_id = %user_id, "No rate window to increment");
                return Ok(());
            };

            let mut next = stored.current(now, &self.policy);
            next.count = next.count.saturating_add(1);

            if self.store.compare_and_swap(user_id, Some(stored), next).await? {
                info!(
                    user_id = %user_id,
                    count = next.count,
                    quota = self.policy.quota,
                    "Email send recorded"
                );
                return Ok(());
            }
        }

        Err(self.contention(user_id))
    }

    /// Atomically check and record one send.
    ///
    /// Fails with [`SendgateError::RateLimitExceeded`] when the quota is spent;
    /// nothing is recorded in that case.
    pub async fn try_acquire(&self, user_id: &str) -> Result<RateLimitDecision> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let stored = self.store.get(user_id).await?;
            let current = match stored {
                Some(window) => window.current(now, &self.policy),
                None => RateWindow::fresh(now),
            };

            if current.count >= self.policy.quota {
                let reset_in = current.reset_in(now, &self.policy);
                if stored != Some(current) {
                    // Persist the rollover so later checks agree.
                    let _ = self.store.compare_and_swap(user_id, stored, current).await?;
                }
                warn!(
                    user_id = %user_id,
                    reset_in_secs = crate::error::ceil_secs(reset_in),
                    "Email rate limit exceeded"
                );
                return Err(SendgateError::RateLimitExceeded { reset_in });
            }

            let next = RateWindow {
                count: current.count + 1,
                ..current
            };
            if self.store.compare_and_swap(user_id, stored, next).await? {
                debug!(
                    user_id = %user_id,
                    count = next.count,
                    quota = self.policy.quota,
                    "Send admitted"
                );
                // Report the budget as it was before this send, like `check`.
                return Ok(current.decision(now, &self.policy));
            }
        }

        Err(self.contention(user_id))
    }

    /// Read-only snapshot of a user's budget. Never creates a window.
    pub async fn status(&self, user_id: &str) -> Result<RateLimitDecision> {
        let now = self.clock.now_millis();
        let decision = match self.store.get(user_id).await? {
            Some(window) if !window.is_expired(now, &self.policy) => {
                window.decision(now, &self.policy)
            }
            _ => RateLimitDecision::full(&self.policy),
        };
        Ok(decision)
    }

    /// Give a user a fresh, empty window.
    pub async fn reset(&self, user_id: &str) -> Result<()> {
        let now = self.clock.now_millis();
        self.store.set(user_id, RateWindow::fresh(now)).await?;
        info!(user_id = %user_id, "Rate window reset");
        Ok(())
    }

    /// Remove windows that have been idle for at least two window lengths.
    pub async fn reap_stale(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let idle_after = self
            .policy
            .window_millis()
            .saturating_mul(IDLE_WINDOWS_BEFORE_REAP);
        let removed = self.store.evict_idle(now, idle_after).await?;
        if removed > 0 {
            debug!(removed = removed, "Reaped idle rate windows");
        }
        Ok(removed)
    }

    /// Number of tracked windows.
    pub async fn window_count(&self) -> Result<usize> {
        self.store.len().await
    }

    /// Spawn a task that reaps idle windows every `interval` until `shutdown` fires.
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Rate window reaper started");

            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.reap_stale().await {
                            error!(error = %e, "Failed to reap idle rate windows");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Rate window reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn contention(&self, user_id: &str) -> SendgateError {
        error!(user_id = %user_id, "Rate window update kept losing to concurrent writers");
        SendgateError::Store(format!(
            "rate window for user {} is under heavy contention",
            user_id
        ))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitPolicy::new(2, Duration::from_secs(60)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_creates_window_lazily() {
        let limiter = limiter();
        assert_eq!(limiter.window_count().await.unwrap(), 0);

        let decision = limiter.check("user-1").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_in, Duration::from_secs(60));
        assert_eq!(limiter.window_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_is_idempotent() {
        let limiter = limiter();

        let first = limiter.check("user-1").await.unwrap();
        let second = limiter.check("user-1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhausted_after_admitted_sends() {
        let limiter = limiter();

        for expected_remaining in [2, 1] {
            let decision = limiter.check("user-1").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_ok!(limiter.increment("user-1").await);
        }

        let decision = limiter.check("user-1").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_length_elapses() {
        let limiter = limiter();
        limiter.check("user-1").await.unwrap();
        limiter.increment("user-1").await.unwrap();
        limiter.increment("user-1").await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        let decision = limiter.check("user-1").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reset_in, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        let decision = limiter.check("user-1").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_in, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_without_check_is_noop() {
        let limiter = limiter();
        limiter.increment("ghost").await.unwrap();
        assert_eq!(limiter.window_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_after_expiry_opens_fresh_window() {
        let limiter = limiter();
        limiter.check("user-1").await.unwrap();
        limiter.increment("user-1").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.increment("user-1").await.unwrap();

        let status = limiter.status("user-1").await.unwrap();
        assert_eq!(status.remaining, 1);
        assert_eq!(status.reset_in, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_have_separate_windows() {
        let limiter = limiter();
        limiter.try_acquire("user-1").await.unwrap();
        limiter.try_acquire("user-1").await.unwrap();

        assert!(!limiter.check("user-1").await.unwrap().allowed);
        assert!(limiter.check("user-2").await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_rejects_over_quota() {
        let limiter = limiter();

        let first = limiter.try_acquire("user-1").await.unwrap();
        assert_eq!(first.remaining, 2);
        let second = limiter.try_acquire("user-1").await.unwrap();
        assert_eq!(second.remaining, 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        match limiter.try_acquire("user-1").await {
            Err(SendgateError::RateLimitExceeded { reset_in }) => {
                assert_eq!(reset_in, Duration::from_secs(40));
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }

        // The rejected attempt did not consume budget.
        assert_eq!(limiter.status("user-1").await.unwrap().remaining, 0);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(limiter.try_acquire("user-1").await.unwrap().remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_does_not_create_window() {
        let limiter = limiter();

        let status = limiter.status("user-1").await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 2);
        assert_eq!(status.limit, 2);
        assert_eq!(status.reset_in, Duration::from_secs(60));
        assert_eq!(limiter.window_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_full_quota_for_expired_window() {
        let limiter = limiter();
        limiter.try_acquire("user-1").await.unwrap();
        assert_eq!(limiter.status("user-1").await.unwrap().remaining, 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.status("user-1").await.unwrap().remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_quota() {
        let limiter = limiter();
        limiter.try_acquire("user-1").await.unwrap();
        limiter.try_acquire("user-1").await.unwrap();

        limiter.reset("user-1").await.unwrap();
        assert_eq!(limiter.check("user-1").await.unwrap().remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_keeps_windows_younger_than_two_lengths() {
        let limiter = limiter();
        limiter.check("idle").await.unwrap();

        tokio::time::advance(Duration::from_secs(70)).await;
        limiter.check("active").await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        // idle started 120s ago, active 50s ago
        assert_eq!(limiter.reap_stale().await.unwrap(), 1);
        assert_eq!(limiter.window_count().await.unwrap(), 1);
        assert_eq!(limiter.status("active").await.unwrap().remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_task_runs_until_cancelled() {
        let limiter = Arc::new(limiter());
        limiter.check("user-1").await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = limiter
            .clone()
            .spawn_reaper(Duration::from_secs(300), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(limiter.window_count().await.unwrap(), 0);

        shutdown.cancel();
        assert_ok!(handle.await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_never_oversells() {
        let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(
            5,
            Duration::from_secs(3600),
        )));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_acquire("shared").await.is_ok() })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(admitted, 5);
    }
}
