//! Dispatch results and where they are recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::error::Result;

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Every recipient was processed
    Completed,
    /// Stopped by cancellation; a checkpoint allows resuming
    Interrupted,
}

/// Outcome of sending one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub campaign_id: String,
    pub sent_count: u64,
    pub failed_count: u64,
    pub total_recipients: u64,
    pub status: DispatchStatus,
    pub finished_at: DateTime<Utc>,
}

impl DispatchResult {
    /// Recipients not yet processed.
    pub fn pending(&self) -> u64 {
        self.total_recipients
            .saturating_sub(self.sent_count + self.failed_count)
    }
}

/// Persists campaign statistics once a dispatch completes.
#[async_trait]
pub trait StatisticsSink: Send + Sync {
    async fn record(&self, result: &DispatchResult) -> Result<()>;
}

/// Logs results instead of persisting them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatisticsSink;

#[async_trait]
impl StatisticsSink for LogStatisticsSink {
    async fn record(&self, result: &DispatchResult) -> Result<()> {
        info!(
            campaign_id = %result.campaign_id,
            sent = result.sent_count,
            failed = result.failed_count,
            total = result.total_recipients,
            "Campaign statistics recorded"
        );
        Ok(())
    }
}

/// Keeps the latest result per campaign in memory.
#[derive(Debug, Default)]
pub struct InMemoryStatisticsSink {
    results: RwLock<HashMap<String, DispatchResult>>,
}

impl InMemoryStatisticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, campaign_id: &str) -> Option<DispatchResult> {
        self.results.read().get(campaign_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }
}

#[async_trait]
impl StatisticsSink for InMemoryStatisticsSink {
    async fn record(&self, result: &DispatchResult) -> Result<()> {
        self.results
            .write()
            .insert(result.campaign_id.clone(), result.clone());
        Ok(())
    }
}
