use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sendgate::dispatch::{
    Campaign, CampaignDispatcher, DispatchOptions, DispatchStatus, InMemoryCampaignSource,
    InMemoryStatisticsSink, ThrottlePolicy,
};
use sendgate::email::{EmailSender, EmailService, OutboundEmail, Recipient, SendReceipt};
use sendgate::error::Result;
use sendgate::ratelimit::{RateLimitPolicy, RateLimiter};

/// Remembers when each message went out.
struct TimedSender {
    start: Instant,
    sends: Mutex<Vec<(String, Duration)>>,
}

impl TimedSender {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            sends: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EmailSender for TimedSender {
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt> {
        self.sends
            .lock()
            .push((email.to.clone(), self.start.elapsed()));
        Ok(SendReceipt {
            message_id: uuid::Uuid::new_v4().to_string(),
            sent_at: chrono::Utc::now(),
        })
    }
}

fn campaigns() -> Arc<InMemoryCampaignSource> {
    Arc::new(
        [
            Campaign {
                id: "spring".into(),
                subject: "Spring collection".into(),
                content: "<p>New arrivals</p>".into(),
            },
            Campaign {
                id: "autumn".into(),
                subject: "Autumn collection".into(),
                content: "<p>Coming soon</p>".into(),
            },
        ]
        .into_iter()
        .collect(),
    )
}

fn recipients(prefix: &str, n: usize) -> Vec<Recipient> {
    (0..n)
        .map(|i| Recipient::new(format!("{}{}@example.com", prefix, i)))
        .collect()
}

fn options(policy: ThrottlePolicy) -> DispatchOptions {
    DispatchOptions {
        inter_send_pause: Duration::ZERO,
        throttle_policy: policy,
        max_throttle_retries: 3,
    }
}

#[tokio::test(start_paused = true)]
async fn quota_two_three_recipients_pauses_then_sends_all() {
    let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(2, Duration::from_secs(60))));
    let sender = Arc::new(TimedSender::new());
    let stats = Arc::new(InMemoryStatisticsSink::new());
    let dispatcher = CampaignDispatcher::new(
        EmailService::new(limiter.clone(), sender.clone()),
        campaigns(),
        stats.clone(),
    )
    .with_options(options(ThrottlePolicy::RetryAfterReset));

    let result = dispatcher
        .dispatch_campaign("marketer", "spring", &recipients("a", 3), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.sent_count, 3);
    assert_eq!(result.failed_count, 0);
    assert_eq!(result.total_recipients, 3);
    assert_eq!(result.status, DispatchStatus::Completed);

    let sends = sender.sends.lock().clone();
    assert_eq!(sends[0].1, Duration::ZERO);
    assert_eq!(sends[1].1, Duration::ZERO);
    assert!(sends[2].1 >= Duration::from_secs(60));

    assert_eq!(stats.get("spring").unwrap().sent_count, 3);

    // The last send opened a new window.
    let status = limiter.status("marketer").await.unwrap();
    assert_eq!(status.remaining, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_dispatches_share_one_quota() {
    let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(2, Duration::from_secs(60))));
    let sender = Arc::new(TimedSender::new());
    let email = EmailService::new(limiter, sender.clone());
    let stats = Arc::new(InMemoryStatisticsSink::new());

    let first = CampaignDispatcher::new(email.clone(), campaigns(), stats.clone())
        .with_options(options(ThrottlePolicy::RetryAfterReset));
    let second = CampaignDispatcher::new(email, campaigns(), stats.clone())
        .with_options(options(ThrottlePolicy::RetryAfterReset));

    let spring = recipients("s", 2);
    let autumn = recipients("f", 2);
    let token = CancellationToken::new();

    let (a, b) = tokio::join!(
        first.dispatch_campaign("marketer", "spring", &spring, &token),
        second.dispatch_campaign("marketer", "autumn", &autumn, &token),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.sent_count + b.sent_count, 4);
    assert_eq!(a.failed_count + b.failed_count, 0);
    assert_eq!(stats.len(), 2);

    // Never more than the quota inside the first window.
    let sends = sender.sends.lock().clone();
    let first_window = sends
        .iter()
        .filter(|(_, at)| *at < Duration::from_secs(60))
        .count();
    assert_eq!(first_window, 2);
}

#[tokio::test(start_paused = true)]
async fn test_email_is_throttled_while_campaign_holds_the_quota() {
    let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(2, Duration::from_secs(60))));
    let sender = Arc::new(TimedSender::new());
    let email = EmailService::new(limiter, sender);

    let dispatcher = CampaignDispatcher::new(
        email.clone(),
        campaigns(),
        Arc::new(InMemoryStatisticsSink::new()),
    )
    .with_options(options(ThrottlePolicy::CountAndSkip));

    let result = dispatcher
        .dispatch_campaign("marketer", "spring", &recipients("a", 2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.sent_count, 2);

    let err = email
        .send_test_email(
            "marketer",
            &OutboundEmail::new("me@example.com", "Preview", "<p>Preview</p>"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    assert!(err.to_string().contains("Reset in 60 seconds"));

    let status = email.rate_status("marketer").await.unwrap();
    assert!(!status.allowed);
    assert_eq!(status.reset_in_secs(), 60);
}
