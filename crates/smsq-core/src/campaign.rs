//! Campaign template: audience selection, message body and cadence settings.

use std::{sync::OnceLock, time::Duration};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{CampaignId, OwnerId, PhoneNumber, Recipient},
    errors::Error,
    Result,
};

pub const NAME_PLACEHOLDER: &str = "{name}";
pub const PHONE_PLACEHOLDER: &str = "{phone_number}";
const ACCEPTED_PLACEHOLDERS: [&str; 2] = [NAME_PLACEHOLDER, PHONE_PLACEHOLDER];

/// Recipients per batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BatchSize {
    #[default]
    Mini,
    Small,
    Medium,
    Large,
}

impl BatchSize {
    pub const fn get(self) -> usize {
        match self {
            Self::Mini => 50,
            Self::Small => 100,
            Self::Medium => 150,
            Self::Large => 200,
        }
    }
}

impl TryFrom<u32> for BatchSize {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            50 => Ok(Self::Mini),
            100 => Ok(Self::Small),
            150 => Ok(Self::Medium),
            200 => Ok(Self::Large),
            other => Err(Error::Validation(format!(
                "batch size must be one of 50, 100, 150, 200 (got {other})"
            ))),
        }
    }
}

impl From<BatchSize> for u32 {
    fn from(v: BatchSize) -> Self {
        v.get() as u32
    }
}

/// Minutes to wait between two batches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BufferTime {
    Short,
    #[default]
    Moderate,
    Long,
}

impl BufferTime {
    pub const fn minutes(self) -> u64 {
        match self {
            Self::Short => 1,
            Self::Moderate => 2,
            Self::Long => 5,
        }
    }

    pub const fn duration(self) -> Duration {
        Duration::from_secs(self.minutes() * 60)
    }
}

impl TryFrom<u32> for BufferTime {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Short),
            2 => Ok(Self::Moderate),
            5 => Ok(Self::Long),
            other => Err(Error::Validation(format!(
                "buffer time must be 1, 2 or 5 minutes (got {other})"
            ))),
        }
    }
}

impl From<BufferTime> for u32 {
    fn from(v: BufferTime) -> Self {
        v.minutes() as u32
    }
}

/// Fixed per-message delay inside a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl ThrottleLevel {
    pub const fn delay(self) -> Duration {
        match self {
            Self::Low => Duration::from_millis(20),
            Self::Medium => Duration::from_millis(10),
            Self::High => Duration::from_millis(7),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(Error::Validation(format!("unknown throttle level: {other}"))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Operator input for a new campaign.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CampaignDraft {
    pub name: String,
    pub contact_groups: Vec<String>,
    pub message: String,
    #[serde(default)]
    pub batch_size: BatchSize,
    #[serde(default)]
    pub buffer_time: BufferTime,
    #[serde(default)]
    pub throttle: ThrottleLevel,
    pub sender: PhoneNumber,
    #[serde(default = "default_include_opt_out")]
    pub include_opt_out: bool,
}

fn default_include_opt_out() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub contact_groups: Vec<String>,
    pub message: String,
    pub batch_size: BatchSize,
    pub buffer_time: BufferTime,
    pub throttle: ThrottleLevel,
    pub sender: PhoneNumber,
    /// Replies with the stop keyword add the replier to the owner's opt-out list.
    pub include_opt_out: bool,
    pub owner: OwnerId,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    /// Validate a draft and stamp it with an id and owner.
    pub fn from_draft(id: CampaignId, owner: OwnerId, draft: CampaignDraft) -> Result<Self> {
        let campaign = Self {
            id,
            name: draft.name.trim().to_string(),
            contact_groups: draft.contact_groups,
            message: draft.message,
            batch_size: draft.batch_size,
            buffer_time: draft.buffer_time,
            throttle: draft.throttle,
            sender: draft.sender,
            include_opt_out: draft.include_opt_out,
            owner,
            created_at: Utc::now(),
        };
        campaign.validate()?;
        Ok(campaign)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("campaign name cannot be empty".to_string()));
        }
        if self.contact_groups.is_empty() {
            return Err(Error::Validation(format!(
                "campaign {} has no contact groups",
                self.name
            )));
        }
        if self.sender.as_str().trim().is_empty() {
            return Err(Error::Validation(format!(
                "campaign {} has no sender address",
                self.name
            )));
        }
        validate_template(&self.message)
    }

    /// Number of batches needed for `recipients` eligible numbers.
    pub fn total_batches(&self, recipients: usize) -> u32 {
        recipients.div_ceil(self.batch_size.get()) as u32
    }

    pub fn render_for(&self, recipient: &Recipient) -> String {
        render_template(&self.message, recipient)
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(.*?)\}").expect("valid regex"))
}

/// Reject empty bodies and any `{...}` placeholder other than the accepted ones.
pub fn validate_template(message: &str) -> Result<()> {
    if message.trim().is_empty() {
        return Err(Error::Validation("message body cannot be empty".to_string()));
    }

    for cap in placeholder_re().captures_iter(message) {
        let whole = cap.get(0).map(|m| m.as_str()).unwrap_or_default();
        if !ACCEPTED_PLACEHOLDERS.contains(&whole) {
            let inner = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
            return Err(Error::Validation(format!(
                "invalid placeholder '{inner}' in message. Allowed variables: {}",
                ACCEPTED_PLACEHOLDERS.join(", ")
            )));
        }
    }

    Ok(())
}

pub fn render_template(message: &str, recipient: &Recipient) -> String {
    message
        .replace(NAME_PLACEHOLDER, &recipient.name)
        .replace(PHONE_PLACEHOLDER, recipient.phone_number.as_str())
}
