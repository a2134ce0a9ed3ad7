//! Campaign content and lookup.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::email::{OutboundEmail, Recipient};
use crate::error::Result;

/// The content sent to every recipient of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub subject: String,
    /// HTML body
    pub content: String,
}

impl Campaign {
    /// The message addressed to one recipient.
    pub fn message_for(&self, recipient: &Recipient) -> OutboundEmail {
        OutboundEmail::new("", self.subject.clone(), self.content.clone())
            .to_recipient(recipient)
            .for_campaign(&self.id)
    }
}

/// Query interface for campaigns owned by the caller.
#[async_trait]
pub trait CampaignSource: Send + Sync {
    async fn find_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>>;
}

/// Campaigns held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCampaignSource {
    campaigns: RwLock<HashMap<String, Campaign>>,
}

impl InMemoryCampaignSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, campaign: Campaign) {
        self.campaigns.write().insert(campaign.id.clone(), campaign);
    }
}

impl FromIterator<Campaign> for InMemoryCampaignSource {
    fn from_iter<I: IntoIterator<Item = Campaign>>(iter: I) -> Self {
        let source = Self::new();
        for campaign in iter {
            source.insert(campaign);
        }
        source
    }
}

#[async_trait]
impl CampaignSource for InMemoryCampaignSource {
    async fn find_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        Ok(self.campaigns.read().get(campaign_id).cloned())
    }
}
