//! Rate limited single-message sending.

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::message::{OutboundEmail, SendReceipt};
use super::sender::EmailSender;
use crate::error::{Result, SendgateError};
use crate::ratelimit::{RateLimitDecision, RateLimiter};

/// Sends messages on behalf of a user, charging each attempt to the user's quota.
#[derive(Clone)]
pub struct EmailService {
    limiter: Arc<RateLimiter>,
    sender: Arc<dyn EmailSender>,
}

impl EmailService {
    pub fn new(limiter: Arc<RateLimiter>, sender: Arc<dyn EmailSender>) -> Self {
        Self { limiter, sender }
    }

    /// Send one message for `user_id`.
    ///
    /// The quota is reserved before the transport is called, so an admitted
    /// attempt counts against the window even if delivery fails.
    #[instrument(skip(self, email), fields(to = %email.to, campaign_id = ?email.campaign_id))]
    pub async fn send_email(&self, user_id: &str, email: &OutboundEmail) -> Result<SendReceipt> {
        let decision = self.limiter.try_acquire(user_id).await?;

        match self.sender.send(email).await {
            Ok(receipt) => {
                info!(
                    user_id = %user_id,
                    subject = %email.subject,
                    message_id = %receipt.message_id,
                    remaining = decision.remaining.saturating_sub(1),
                    "Email sent successfully"
                );
                Ok(receipt)
            }
            Err(e) => {
                error!(user_id = %user_id, to = %email.to, error = %e, "Email sending failed");
                Err(match e {
                    SendgateError::SendFailure(reason) => SendgateError::SendFailure(reason),
                    other => SendgateError::SendFailure(other.to_string()),
                })
            }
        }
    }

    /// Send an ad-hoc test message.
    ///
    /// Throttling surfaces to the caller as [`SendgateError::RateLimitExceeded`].
    pub async fn send_test_email(
        &self,
        user_id: &str,
        email: &OutboundEmail,
    ) -> Result<SendReceipt> {
        if user_id.is_empty() {
            return Err(SendgateError::InvalidInput("user identity is required".into()));
        }
        if email.to.trim().is_empty()
            || email.subject.trim().is_empty()
            || email.content.trim().is_empty()
        {
            return Err(SendgateError::InvalidInput(
                "to, subject, and content are required".into(),
            ));
        }

        self.send_email(user_id, email).await.inspect_err(|e| {
            if let Some(reset_in) = e.retry_after() {
                warn!(
                    user_id = %user_id,
                    reset_in_secs = crate::error::ceil_secs(reset_in),
                    "Test email throttled"
                );
            }
        })
    }

    /// Whether `user_id` may send now. Does not record a send.
    pub async fn check_rate_limit(&self, user_id: &str) -> Result<RateLimitDecision> {
        self.limiter.check(user_id).await
    }

    /// Record a send made outside [`EmailService::send_email`].
    pub async fn record_send(&self, user_id: &str) -> Result<()> {
        self.limiter.increment(user_id).await
    }

    /// Read-only view of `user_id`'s budget.
    pub async fn rate_status(&self, user_id: &str) -> Result<RateLimitDecision> {
        self.limiter.status(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::LogSender;
    use crate::ratelimit::RateLimitPolicy;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingSender;

    #[async_trait]
    impl EmailSender for FailingSender {
        async fn send(&self, _email: &OutboundEmail) -> Result<SendReceipt> {
            Err(SendgateError::SendFailure("relay refused".into()))
        }
    }

    fn service(sender: Arc<dyn EmailSender>) -> EmailService {
        let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(
            2,
            Duration::from_secs(60),
        )));
        EmailService::new(limiter, sender)
    }

    fn email() -> OutboundEmail {
        OutboundEmail::new("grace@example.com", "Launch", "<p>We launched</p>")
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_email_charges_quota() {
        let service = service(Arc::new(LogSender));

        service.send_email("user-1", &email()).await.unwrap();
        assert_eq!(service.rate_status("user-1").await.unwrap().remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_send_is_throttled() {
        let service = service(Arc::new(LogSender));

        service.send_email("user-1", &email()).await.unwrap();
        service.send_email("user-1", &email()).await.unwrap();

        let err = service.send_email("user-1", &email()).await.unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_still_counts_attempt() {
        let service = service(Arc::new(FailingSender));

        let err = service.send_email("user-1", &email()).await.unwrap_err();
        assert!(matches!(err, SendgateError::SendFailure(_)));
        assert_eq!(service.rate_status("user-1").await.unwrap().remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_test_email_validates_fields() {
        let service = service(Arc::new(LogSender));

        let blank = OutboundEmail::new("grace@example.com", "", "body");
        let err = service.send_test_email("user-1", &blank).await.unwrap_err();
        assert!(matches!(err, SendgateError::InvalidInput(_)));

        // Validation failures do not touch the quota.
        assert_eq!(service.rate_status("user-1").await.unwrap().remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_send_after_check() {
        let service = service(Arc::new(LogSender));

        assert!(service.check_rate_limit("user-1").await.unwrap().allowed);
        service.record_send("user-1").await.unwrap();
        service.record_send("user-1").await.unwrap();
        assert!(!service.check_rate_limit("user-1").await.unwrap().allowed);
    }
}
