//! Sequential, throttled campaign dispatch.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::campaign::{Campaign, CampaignSource};
use super::checkpoint::{CheckpointStore, DispatchCursor, InMemoryCheckpointStore};
use super::stats::{DispatchResult, DispatchStatus, StatisticsSink};
use crate::config::DispatchConfig;
use crate::email::{EmailService, Recipient};
use crate::error::{ceil_secs, Result, SendgateError};

/// What happens to a recipient whose send was throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlePolicy {
    /// Wait for the window to reset and retry the same recipient
    #[default]
    RetryAfterReset,
    /// Count the recipient as failed, wait for the reset, move on
    CountAndSkip,
}

/// Pacing and throttle handling for a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Pause between consecutive recipients, whatever the outcome.
    ///
    /// Not applied after the last recipient, nor between throttled retries
    /// of the same recipient, which wait for the window reset instead.
    pub inter_send_pause: Duration,
    pub throttle_policy: ThrottlePolicy,
    /// Throttled retries per recipient before it is counted as failed
    pub max_throttle_retries: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for DispatchOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            inter_send_pause: config.inter_send_pause(),
            throttle_policy: config.throttle_policy,
            max_throttle_retries: config.max_throttle_retries,
        }
    }
}

/// Result of handling one recipient.
enum Attempt {
    Sent,
    Failed,
    /// Cancelled before the recipient was settled
    Unprocessed,
}

/// Counters carried through a dispatch.
#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    next_index: usize,
    sent: u64,
    failed: u64,
}

/// Sends a campaign to its recipients one at a time under the user's rate limit.
pub struct CampaignDispatcher {
    email: EmailService,
    campaigns: Arc<dyn CampaignSource>,
    statistics: Arc<dyn StatisticsSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: DispatchOptions,
}

impl CampaignDispatcher {
    /// Create a dispatcher with default pacing and in-memory checkpoints.
    pub fn new(
        email: EmailService,
        campaigns: Arc<dyn CampaignSource>,
        statistics: Arc<dyn StatisticsSink>,
    ) -> Self {
        Self {
            email,
            campaigns,
            statistics,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            options: DispatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Send `campaign_id` to every recipient in order on behalf of `user_id`.
    ///
    /// Individual failures never abort the dispatch. If `shutdown` fires the
    /// progress is checkpointed and the result is marked
    /// [`DispatchStatus::Interrupted`]; calling again resumes from there.
    #[instrument(skip(self, recipients, shutdown), fields(recipients = recipients.len()))]
    pub async fn dispatch_campaign(
        &self,
        user_id: &str,
        campaign_id: &str,
        recipients: &[Recipient],
        shutdown: &CancellationToken,
    ) -> Result<DispatchResult> {
        if user_id.is_empty() {
            return Err(SendgateError::InvalidInput("user identity is required".into()));
        }
        if recipients.is_empty() {
            return Err(SendgateError::InvalidInput(format!(
                "campaign {} has no recipients",
                campaign_id
            )));
        }
        let campaign = self
            .campaigns
            .find_campaign(campaign_id)
            .await?
            .ok_or_else(|| {
                SendgateError::InvalidInput(format!("campaign not found: {}", campaign_id))
            })?;

        let total = recipients.len();
        let mut progress = self.resume_point(user_id, campaign_id, total).await;

        info!(
            user_id = %user_id,
            campaign_id = %campaign_id,
            total = total,
            start_index = progress.next_index,
            "Starting campaign dispatch"
        );

        let mut interrupted = false;
        while progress.next_index < total {
            if shutdown.is_cancelled() {
                interrupted = true;
                break;
            }

            let recipient = &recipients[progress.next_index];
            let (attempt, running) = self
                .deliver(user_id, &campaign, recipient, shutdown)
                .await;

            match attempt {
                Attempt::Sent => progress.sent += 1,
                Attempt::Failed => progress.failed += 1,
                Attempt::Unprocessed => {
                    interrupted = true;
                    break;
                }
            }
            progress.next_index += 1;
            self.save_checkpoint(user_id, campaign_id, total, progress).await;

            if !running {
                interrupted = true;
                break;
            }
            if progress.next_index < total
                && !self.pause(self.options.inter_send_pause, shutdown).await
            {
                interrupted = true;
                break;
            }
        }

        let result = DispatchResult {
            campaign_id: campaign_id.to_string(),
            sent_count: progress.sent,
            failed_count: progress.failed,
            total_recipients: total as u64,
            status: if interrupted {
                DispatchStatus::Interrupted
            } else {
                DispatchStatus::Completed
            },
            finished_at: Utc::now(),
        };

        if interrupted {
            self.save_checkpoint(user_id, campaign_id, total, progress).await;
            warn!(
                campaign_id = %campaign_id,
                sent = result.sent_count,
                failed = result.failed_count,
                next_index = progress.next_index,
                "Campaign dispatch interrupted; progress checkpointed"
            );
            return Ok(result);
        }

        if let Err(e) = self.checkpoints.clear(campaign_id).await {
            error!(campaign_id = %campaign_id, error = %e, "Failed to clear dispatch checkpoint");
        }
        if let Err(e) = self.statistics.record(&result).await {
            error!(campaign_id = %campaign_id, error = %e, "Failed to record campaign statistics");
        }

        info!(
            campaign_id = %campaign_id,
            sent = result.sent_count,
            failed = result.failed_count,
            total = result.total_recipients,
            "Campaign dispatch completed"
        );
        Ok(result)
    }

    /// Send to one recipient, handling throttling per the configured policy.
    ///
    /// The flag is `false` once cancellation was observed.
    async fn deliver(
        &self,
        user_id: &str,
        campaign: &Campaign,
        recipient: &Recipient,
        shutdown: &CancellationToken,
    ) -> (Attempt, bool) {
        let email = campaign.message_for(recipient);
        let mut throttles = 0u32;

        loop {
            match self.email.send_email(user_id, &email).await {
                Ok(_) => return (Attempt::Sent, true),
                Err(SendgateError::RateLimitExceeded { reset_in }) => {
                    throttles += 1;
                    let give_up = self.options.throttle_policy == ThrottlePolicy::CountAndSkip
                        || throttles > self.options.max_throttle_retries;

                    warn!(
                        user_id = %user_id,
                        campaign_id = %campaign.id,
                        to = %recipient.address,
                        wait_secs = ceil_secs(reset_in),
                        give_up = give_up,
                        "Rate limit hit, waiting for window reset"
                    );

                    let running = self.pause(reset_in, shutdown).await;
                    if give_up {
                        return (Attempt::Failed, running);
                    }
                    if !running {
                        return (Attempt::Unprocessed, false);
                    }
                    debug!(
                        to = %recipient.address,
                        attempt = throttles + 1,
                        "Retrying throttled send"
                    );
                }
                Err(e) => {
                    error!(
                        user_id = %user_id,
                        campaign_id = %campaign.id,
                        to = %recipient.address,
                        error = %e,
                        "Failed to send campaign email"
                    );
                    return (Attempt::Failed, true);
                }
            }
        }
    }

    /// Sleep for `duration` unless `shutdown` fires first. Returns `false` if cancelled.
    async fn pause(&self, duration: Duration, shutdown: &CancellationToken) -> bool {
        if shutdown.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    /// Where to start. An unreadable or mismatched checkpoint restarts at 0.
    async fn resume_point(&self, user_id: &str, campaign_id: &str, total: usize) -> Progress {
        let cursor = match self.checkpoints.load(campaign_id).await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => return Progress::default(),
            Err(e) => {
                error!(
                    campaign_id = %campaign_id,
                    error = %e,
                    "Failed to load dispatch checkpoint, starting from the first recipient"
                );
                return Progress::default();
            }
        };

        if cursor.total_recipients != total as u64
            || cursor.user_id != user_id
            || cursor.next_index > total
        {
            warn!(
                campaign_id = %campaign_id,
                checkpoint_total = cursor.total_recipients,
                total = total,
                "Ignoring checkpoint that does not match this dispatch"
            );
            return Progress::default();
        }

        info!(
            campaign_id = %campaign_id,
            next_index = cursor.next_index,
            "Resuming campaign dispatch from checkpoint"
        );
        Progress {
            next_index: cursor.next_index,
            sent: cursor.sent_count,
            failed: cursor.failed_count,
        }
    }

    async fn save_checkpoint(
        &self,
        user_id: &str,
        campaign_id: &str,
        total: usize,
        progress: Progress,
    ) {
        let cursor = DispatchCursor {
            campaign_id: campaign_id.to_string(),
            user_id: user_id.to_string(),
            next_index: progress.next_index,
            sent_count: progress.sent,
            failed_count: progress.failed,
            total_recipients: total as u64,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.checkpoints.save(&cursor).await {
            error!(campaign_id = %campaign_id, error = %e, "Failed to save dispatch checkpoint");
        }
    }
}
