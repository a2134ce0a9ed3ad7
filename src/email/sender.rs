//! Pluggable email transports.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::message::{OutboundEmail, SendReceipt};
use crate::config::{SenderConfig, SenderKind};
use crate::error::{Result, SendgateError};

/// Transport that delivers a single message.
///
/// Failures are reported as [`SendgateError::SendFailure`].
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt>;
}

/// Build the transport selected in configuration.
pub fn sender_from_config(config: &SenderConfig) -> Arc<dyn EmailSender> {
    match config.kind {
        SenderKind::Log => Arc::new(LogSender),
        SenderKind::Simulated => Arc::new(SimulatedSender::new(
            Duration::from_millis(config.latency_ms),
            config.failure_rate,
        )),
    }
}

/// Writes each message to the log and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl EmailSender for LogSender {
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt> {
        let receipt = SendReceipt {
            message_id: format!("log_{}", uuid::Uuid::new_v4().simple()),
            sent_at: Utc::now(),
        };
        info!(
            to = %email.to,
            to_name = ?email.to_name,
            subject = %email.subject,
            campaign_id = ?email.campaign_id,
            message_id = %receipt.message_id,
            "Email delivered to log transport"
        );
        Ok(receipt)
    }
}

/// Stand-in for a real SMTP relay: waits a fixed latency and fails at random.
#[derive(Debug, Clone)]
pub struct SimulatedSender {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedSender {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for SimulatedSender {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 0.05)
    }
}

#[async_trait]
impl EmailSender for SimulatedSender {
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt> {
        tokio::time::sleep(self.latency).await;

        let failed = rand::thread_rng().gen_bool(self.failure_rate);
        if failed {
            debug!(to = %email.to, "Simulated delivery failure");
            return Err(SendgateError::SendFailure(
                "Simulated email delivery failure".to_string(),
            ));
        }

        Ok(SendReceipt {
            message_id: format!(
                "sim_{}_{}",
                Utc::now().timestamp_millis(),
                &uuid::Uuid::new_v4().simple().to_string()[..9]
            ),
            sent_at: Utc::now(),
        })
    }
}
