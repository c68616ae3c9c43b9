//! Conversions between typed records and column values.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;

use smsq_core::{
    campaign::{BatchSize, BufferTime, Campaign, ThrottleLevel},
    domain::{Contact, OptOutScope},
    errors::Error,
    message::{ContentKind, DeliveryStatus, Direction, MessageRecord},
    queue::{QueueEntry, QueueStatus},
    Result,
};

/// Fixed-width UTC timestamps so text order is time order.
pub(crate) fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(v: &T) -> Result<String> {
    Ok(serde_json::to_string(v)?)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn scope_str(scope: OptOutScope) -> &'static str {
    match scope {
        OptOutScope::Platform => "platform",
        OptOutScope::Owner => "owner",
    }
}

pub(crate) struct ContactRow {
    owner: String,
    phone_number: String,
    name: String,
    groups: String,
}

impl ContactRow {
    pub(crate) const COLUMNS: &'static str = "owner, phone_number, name, groups";

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            owner: row.get(0)?,
            phone_number: row.get(1)?,
            name: row.get(2)?,
            groups: row.get(3)?,
        })
    }

    pub(crate) fn into_contact(self) -> Result<Contact> {
        Ok(Contact {
            owner: self.owner.as_str().into(),
            phone_number: self.phone_number.as_str().into(),
            name: self.name,
            groups: from_json(&self.groups)?,
        })
    }
}

pub(crate) struct CampaignRow {
    id: String,
    name: String,
    owner: String,
    contact_groups: String,
    message: String,
    batch_size: u32,
    buffer_minutes: u32,
    throttle: String,
    sender: String,
    include_opt_out: bool,
    created_at: String,
}

impl CampaignRow {
    pub(crate) const COLUMNS: &'static str = "id, name, owner, contact_groups, message, batch_size, \
         buffer_minutes, throttle, sender, include_opt_out, created_at";

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            owner: row.get(2)?,
            contact_groups: row.get(3)?,
            message: row.get(4)?,
            batch_size: row.get(5)?,
            buffer_minutes: row.get(6)?,
            throttle: row.get(7)?,
            sender: row.get(8)?,
            include_opt_out: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    pub(crate) fn into_campaign(self) -> Result<Campaign> {
        Ok(Campaign {
            id: self.id.as_str().into(),
            name: self.name,
            contact_groups: from_json(&self.contact_groups)?,
            message: self.message,
            batch_size: BatchSize::try_from(self.batch_size)?,
            buffer_time: BufferTime::try_from(self.buffer_minutes)?,
            throttle: ThrottleLevel::parse(&self.throttle)?,
            sender: self.sender.as_str().into(),
            include_opt_out: self.include_opt_out,
            owner: self.owner.as_str().into(),
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub(crate) struct QueueRow {
    id: String,
    campaign: String,
    owner: String,
    status: String,
    current_batch: u32,
    total_batches: u32,
    scheduled_at: String,
    task: Option<String>,
    created_at: String,
    updated_at: String,
}

impl QueueRow {
    pub(crate) const COLUMNS: &'static str = "id, campaign, owner, status, current_batch, \
         total_batches, scheduled_at, task, created_at, updated_at";

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            campaign: row.get(1)?,
            owner: row.get(2)?,
            status: row.get(3)?,
            current_batch: row.get(4)?,
            total_batches: row.get(5)?,
            scheduled_at: row.get(6)?,
            task: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    pub(crate) fn into_entry(self) -> Result<QueueEntry> {
        Ok(QueueEntry {
            id: self.id.as_str().into(),
            campaign: self.campaign.as_str().into(),
            owner: self.owner.as_str().into(),
            status: QueueStatus::from_str(&self.status)?,
            current_batch: self.current_batch,
            total_batches: self.total_batches,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            task: self.task.map(|t| t.as_str().into()),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

pub(crate) struct MessageRow {
    id: String,
    external_id: Option<String>,
    sender: String,
    recipient: String,
    body: String,
    sent_at: String,
    direction: String,
    content_kind: String,
    status: String,
    campaigns: String,
    owners: String,
    keyword: Option<String>,
}

impl MessageRow {
    pub(crate) const COLUMNS: &'static str = "id, external_id, sender, recipient, body, sent_at, \
         direction, content_kind, status, campaigns, owners, keyword";

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            external_id: row.get(1)?,
            sender: row.get(2)?,
            recipient: row.get(3)?,
            body: row.get(4)?,
            sent_at: row.get(5)?,
            direction: row.get(6)?,
            content_kind: row.get(7)?,
            status: row.get(8)?,
            campaigns: row.get(9)?,
            owners: row.get(10)?,
            keyword: row.get(11)?,
        })
    }

    pub(crate) fn into_record(self) -> Result<MessageRecord> {
        Ok(MessageRecord {
            id: self.id.as_str().into(),
            external_id: self.external_id,
            sender: self.sender.as_str().into(),
            recipient: self.recipient.as_str().into(),
            body: self.body,
            sent_at: parse_ts(&self.sent_at)?,
            direction: Direction::from_str(&self.direction)?,
            content_kind: ContentKind::from_str(&self.content_kind)?,
            status: DeliveryStatus::from_str(&self.status)?,
            campaigns: from_json(&self.campaigns)?,
            owners: from_json(&self.owners)?,
            keyword: self.keyword,
        })
    }
}
