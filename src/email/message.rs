//! Message and recipient types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a campaign's recipient list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// A message ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    /// Display name for the `To` header
    #[serde(default)]
    pub to_name: Option<String>,
    pub subject: String,
    /// HTML body
    pub content: String,
    /// Campaign the message belongs to, if any
    #[serde(default)]
    pub campaign_id: Option<String>,
}

impl OutboundEmail {
    pub fn new(
        to: impl Into<String>,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            to_name: None,
            subject: subject.into(),
            content: content.into(),
            campaign_id: None,
        }
    }

    /// The message addressed to `recipient`, keeping its display name.
    pub fn to_recipient(mut self, recipient: &Recipient) -> Self {
        self.to = recipient.address.clone();
        self.to_name = recipient.display_name.clone();
        self
    }

    pub fn for_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }
}

/// Proof of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
}
