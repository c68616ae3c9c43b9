use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{CampaignId, MessageRecordId, OwnerId, PhoneNumber},
    errors::Error,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Reply,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Reply => "reply",
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(Self::Sent),
            "reply" => Ok(Self::Reply),
            other => Err(Error::Validation(format!("unknown message direction: {other}"))),
        }
    }
}

/// Carrier content type of a message body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Text,
    Unicode,
    Binary,
}

impl ContentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Unicode => "unicode",
            Self::Binary => "binary",
        }
    }
}

impl FromStr for ContentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "unicode" => Ok(Self::Unicode),
            "binary" => Ok(Self::Binary),
            other => Err(Error::Validation(format!("unknown content type: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Accepted,
    Delivered,
    Buffered,
    Expired,
    Failed,
    Rejected,
    Unknown,
}

impl DeliveryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Delivered => "delivered",
            Self::Buffered => "buffered",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "accepted" => Ok(Self::Accepted),
            "delivered" => Ok(Self::Delivered),
            "buffered" => Ok(Self::Buffered),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::Validation(format!("unknown delivery status: {other}"))),
        }
    }
}

/// One send attempt or inbound reply.
///
/// `external_id == None` on a `Sent` record means the carrier never accepted it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageRecordId,
    pub external_id: Option<String>,
    pub sender: PhoneNumber,
    pub recipient: PhoneNumber,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub direction: Direction,
    pub content_kind: ContentKind,
    pub status: DeliveryStatus,
    pub campaigns: Vec<CampaignId>,
    pub owners: Vec<OwnerId>,
    /// First word of an inbound reply as the carrier parsed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl MessageRecord {
    pub fn is_failed_send(&self) -> bool {
        self.direction == Direction::Sent && self.external_id.is_none()
    }

    /// Identity of an inbound reply across carrier redeliveries. `None` for sent
    /// messages and for replies the carrier gave no id.
    pub fn reply_key(&self) -> Option<(&PhoneNumber, &PhoneNumber, &str)> {
        match (self.direction, self.external_id.as_deref()) {
            (Direction::Reply, Some(ext)) => Some((&self.sender, &self.recipient, ext)),
            _ => None,
        }
    }
}

/// Outcome of applying a delivery receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// The record already carried that status.
    Unchanged,
    /// No record with that (sender, recipient, external id).
    Unmatched,
}
