//! Per-user send rate limiting.

mod clock;
mod limiter;
mod store;
mod window;

pub use clock::{Clock, MonotonicClock, SystemClock};
pub use limiter::RateLimiter;
pub use store::{InMemoryRateStore, RateLimitStore};
pub use window::{RateLimitDecision, RateLimitPolicy, RateWindow, DEFAULT_QUOTA, DEFAULT_WINDOW};
