//! Per-campaign chat threads with a single recipient.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    campaign::Campaign,
    domain::{new_id, CampaignId, MessageRecordId, OwnerId, PhoneNumber},
    errors::Error,
    message::{ContentKind, DeliveryStatus, Direction, MessageRecord},
    messaging::port::MessagingGateway,
    ports::{CampaignStore, MessageStore, Store},
    Result,
};

pub struct Conversations {
    store: Arc<dyn Store>,
    gateway: Arc<dyn MessagingGateway>,
}

impl Conversations {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn MessagingGateway>) -> Self {
        Self { store, gateway }
    }

    /// Sent and reply messages between `campaign` and `phone`, oldest first.
    pub async fn thread(
        &self,
        owner: &OwnerId,
        campaign: &CampaignId,
        phone: &PhoneNumber,
    ) -> Result<Vec<MessageRecord>> {
        self.owned_campaign(owner, campaign).await?;
        self.store.thread(campaign, phone).await
    }

    /// Operator reply from the campaign's sender number.
    pub async fn reply(
        &self,
        owner: &OwnerId,
        campaign: &CampaignId,
        phone: &PhoneNumber,
        text: &str,
    ) -> Result<MessageRecord> {
        if text.trim().is_empty() {
            return Err(Error::Validation("reply text cannot be empty".to_string()));
        }
        let campaign = self.owned_campaign(owner, campaign).await?;
        let receipt = self.gateway.send(&campaign.sender, phone, text).await?;
        if !receipt.is_accepted() {
            return Err(Error::Gateway(format!(
                "carrier rejected reply (status {}): {}",
                receipt.status_code,
                receipt.error_text.as_deref().unwrap_or("no details")
            )));
        }

        let record = MessageRecord {
            id: MessageRecordId(new_id()),
            external_id: receipt.external_id,
            sender: campaign.sender.clone(),
            recipient: phone.clone(),
            body: text.to_string(),
            sent_at: Utc::now(),
            direction: Direction::Sent,
            content_kind: ContentKind::Text,
            status: DeliveryStatus::Unknown,
            campaigns: vec![campaign.id.clone()],
            owners: vec![campaign.owner.clone()],
            keyword: None,
        };
        self.store.insert_messages(vec![record.clone()]).await?;
        tracing::info!(campaign = %campaign.id, to = %phone, "operator reply sent");
        Ok(record)
    }

    async fn owned_campaign(&self, owner: &OwnerId, id: &CampaignId) -> Result<Campaign> {
        match self.store.get_campaign(id).await? {
            Some(c) if &c.owner == owner => Ok(c),
            _ => Err(Error::NotFound(format!("campaign {id}"))),
        }
    }
}
