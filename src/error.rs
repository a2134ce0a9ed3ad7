//! Error types for the Sendgate service.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Sendgate operations.
#[derive(Error, Debug)]
pub enum SendgateError {
    /// The user's send quota for the current window is exhausted
    #[error("Email rate limit exceeded. Reset in {} seconds", reset_hint_secs(.reset_in))]
    RateLimitExceeded {
        /// Time until the window rolls over
        reset_in: Duration,
    },

    /// The transport failed to deliver a message
    #[error("Send failure: {0}")]
    SendFailure(String),

    /// Caller supplied unusable input (empty recipient list, unknown campaign...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit or checkpoint store errors
    #[error("Store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML decoding errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SendgateError {
    /// Whether the same operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendgateError::RateLimitExceeded { .. } | SendgateError::SendFailure(_)
        )
    }

    /// Reset hint for throttled callers.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SendgateError::RateLimitExceeded { reset_in } => Some(*reset_in),
            _ => None,
        }
    }

    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            SendgateError::RateLimitExceeded { .. } => 429,
            SendgateError::InvalidInput(_) => 400,
            SendgateError::SendFailure(_) => 502,
            _ => 500,
        }
    }
}

/// Round a duration up to whole seconds, the way reset hints are shown to users.
pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn reset_hint_secs(reset_in: &Duration) -> u64 {
    ceil_secs(*reset_in)
}

/// Result type alias for Sendgate operations.
pub type Result<T> = std::result::Result<T, SendgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_message_rounds_up() {
        let err = SendgateError::RateLimitExceeded {
            reset_in: Duration::from_millis(41_200),
        };
        assert_eq!(err.to_string(), "Email rate limit exceeded. Reset in 42 seconds");
        assert_eq!(err.retry_after(), Some(Duration::from_millis(41_200)));
        assert_eq!(err.status_code(), 429);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_input_is_terminal() {
        let err = SendgateError::InvalidInput("recipient list is empty".into());
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
    }
}
