//! Matches asynchronous carrier callbacks to stored messages and applies
//! opt-out-by-reply.

use std::{
    collections::{BTreeSet, HashMap},
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{
    config::CorrelatorSettings,
    domain::{
        new_id, CampaignId, MessageRecordId, OptOutEntry, OptOutScope, OwnerId, PhoneNumber,
    },
    errors::Error,
    message::{ContentKind, DeliveryStatus, Direction, MessageRecord, StatusUpdate},
    ports::{CampaignStore, ContactStore, MessageStore, Store},
    Result,
};

pub const CARRIER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const OPT_OUT_REASON: &str = "Opted out";

/// Delivery receipt for a message we sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusCallback {
    /// Our sender number (`to` on the receipt).
    pub sender: PhoneNumber,
    /// The handset (`msisdn`).
    pub recipient: PhoneNumber,
    pub external_id: String,
    pub status: DeliveryStatus,
}

impl StatusCallback {
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            sender: required(params, "to")?.into(),
            recipient: required(params, "msisdn")?.into(),
            external_id: required(params, "messageId")?.to_string(),
            status: DeliveryStatus::from_str(required(params, "status")?)?,
        })
    }
}

/// Message sent to one of our numbers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundReply {
    /// The replying handset (`msisdn`).
    pub from: PhoneNumber,
    /// Our number that received it (`to`).
    pub to: PhoneNumber,
    pub text: String,
    pub content_kind: ContentKind,
    pub external_id: Option<String>,
    pub keyword: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundReply {
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let raw_ts = required(params, "message-timestamp")?;
        let received_at = NaiveDateTime::parse_from_str(raw_ts, CARRIER_TIMESTAMP_FORMAT)
            .map_err(|e| Error::Validation(format!("bad message-timestamp '{raw_ts}': {e}")))?
            .and_utc();
        let content_kind = match params.get("type") {
            Some(t) if !t.trim().is_empty() => ContentKind::from_str(t)?,
            _ => ContentKind::Text,
        };

        Ok(Self {
            from: required(params, "msisdn")?.into(),
            to: required(params, "to")?.into(),
            text: params
                .get("text")
                .cloned()
                .ok_or_else(|| Error::Validation("missing field: text".to_string()))?,
            content_kind,
            external_id: optional(params, "messageId"),
            keyword: optional(params, "keyword"),
            received_at,
        })
    }
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Validation(format!("missing field: {key}")))
}

fn optional(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Result of handling one inbound reply.
#[derive(Clone, Debug)]
pub struct InboundOutcome {
    pub message: MessageRecord,
    /// `false` when the carrier redelivered a reply we already stored.
    pub recorded: bool,
    /// Owners whose opt-out list gained the replier.
    pub opted_out_for: Vec<OwnerId>,
}

pub struct Correlator {
    store: Arc<dyn Store>,
    settings: CorrelatorSettings,
}

impl Correlator {
    pub fn new(store: Arc<dyn Store>, settings: CorrelatorSettings) -> Self {
        Self { store, settings }
    }

    pub fn is_stop_keyword(&self, text: &str) -> bool {
        text.trim().eq_ignore_ascii_case(&self.settings.stop_keyword)
    }

    /// Apply a delivery receipt. Misses are logged and reported, never raised.
    pub async fn on_status(&self, cb: StatusCallback) -> Result<StatusUpdate> {
        let update = self
            .store
            .set_message_status(&cb.sender, &cb.recipient, &cb.external_id, cb.status)
            .await?;
        match update {
            StatusUpdate::Unmatched => tracing::warn!(
                sender = %cb.sender,
                recipient = %cb.recipient,
                external_id = %cb.external_id,
                status = %cb.status,
                "delivery receipt matched no message; dropped"
            ),
            StatusUpdate::Applied => tracing::debug!(
                external_id = %cb.external_id,
                status = %cb.status,
                "delivery status updated"
            ),
            StatusUpdate::Unchanged => {}
        }
        Ok(update)
    }

    pub async fn on_inbound(&self, reply: InboundReply) -> Result<InboundOutcome> {
        let opted_out_for = if self.is_stop_keyword(&reply.text) {
            self.opt_out(&reply).await?
        } else {
            Vec::new()
        };

        let (campaigns, owners) = self.related_campaigns(&reply.from).await?;
        let message = MessageRecord {
            id: MessageRecordId(new_id()),
            external_id: reply.external_id.clone(),
            sender: reply.from.clone(),
            recipient: reply.to.clone(),
            body: reply.text.clone(),
            sent_at: reply.received_at,
            direction: Direction::Reply,
            content_kind: reply.content_kind,
            status: DeliveryStatus::Accepted,
            campaigns,
            owners,
            keyword: reply.keyword.clone(),
        };
        let recorded = self.store.insert_reply(message.clone()).await?;

        if recorded {
            tracing::info!(
                from = %reply.from,
                to = %reply.to,
                campaigns = message.campaigns.len(),
                opted_out = opted_out_for.len(),
                "reply recorded"
            );
        } else {
            tracing::info!(
                from = %reply.from,
                external_id = reply.external_id.as_deref().unwrap_or(""),
                "reply redelivered; already stored"
            );
        }
        Ok(InboundOutcome {
            message,
            recorded,
            opted_out_for,
        })
    }

    /// Owner-scoped opt-out for every owner running an opt-out-enabled campaign from
    /// the number that received the stop reply.
    async fn opt_out(&self, reply: &InboundReply) -> Result<Vec<OwnerId>> {
        let owners: BTreeSet<OwnerId> = self
            .store
            .campaigns_by_sender(&reply.to)
            .await?
            .into_iter()
            .filter(|c| c.include_opt_out)
            .map(|c| c.owner)
            .collect();
        if owners.is_empty() {
            tracing::info!(to = %reply.to, "stop reply but no opt-out enabled campaign uses this number");
        }

        let mut added = Vec::new();
        for owner in owners {
            let inserted = self
                .store
                .insert_opt_out(OptOutEntry {
                    phone_number: reply.from.clone(),
                    reason: OPT_OUT_REASON.to_string(),
                    scope: OptOutScope::Owner,
                    owner: owner.clone(),
                    added_at: Utc::now(),
                })
                .await?;
            if inserted {
                tracing::info!(phone = %reply.from, owner = %owner, "opted out by reply");
                added.push(owner);
            }
        }
        Ok(added)
    }

    /// Campaigns of the replier's owners whose groups include any of the replier's
    /// groups for that owner.
    async fn related_campaigns(
        &self,
        phone: &PhoneNumber,
    ) -> Result<(Vec<CampaignId>, Vec<OwnerId>)> {
        let mut campaigns = BTreeSet::new();
        let mut owners = BTreeSet::new();
        for contact in self.store.find_contacts_by_phone(phone).await? {
            for c in self.store.campaigns_by_owner(&contact.owner).await? {
                if c.contact_groups.iter().any(|g| contact.groups.contains(g)) {
                    campaigns.insert(c.id);
                    owners.insert(c.owner);
                }
            }
        }
        Ok((campaigns.into_iter().collect(), owners.into_iter().collect()))
    }
}
