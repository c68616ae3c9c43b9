//! In-process store for tests and embedders that seed their own data.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    campaign::Campaign,
    domain::{
        CampaignId, Contact, OptOutEntry, OptOutScope, Owner, OwnerId, PhoneNumber, QueueEntryId,
    },
    errors::Error,
    message::{DeliveryStatus, MessageRecord, StatusUpdate},
    ports::{CampaignStore, ContactStore, MessageStore, QueueStore},
    queue::{QueueEntry, QueuePatch, QueueStatus},
    Result,
};

#[derive(Default)]
struct State {
    owners: HashMap<OwnerId, Owner>,
    /// Insertion order is the resolver's ordering.
    contacts: Vec<Contact>,
    opt_outs: Vec<OptOutEntry>,
    campaigns: Vec<Campaign>,
    queue: Vec<QueueEntry>,
    messages: Vec<MessageRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_owner(&self, owner: Owner) {
        self.state.lock().await.owners.insert(owner.id.clone(), owner);
    }

    pub async fn add_contact(&self, contact: Contact) {
        self.state.lock().await.contacts.push(contact);
    }

    pub async fn messages(&self) -> Vec<MessageRecord> {
        self.state.lock().await.messages.clone()
    }

    pub async fn opt_outs(&self) -> Vec<OptOutEntry> {
        self.state.lock().await.opt_outs.clone()
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn find_owner(&self, owner: &OwnerId) -> Result<Option<Owner>> {
        Ok(self.state.lock().await.owners.get(owner).cloned())
    }

    async fn owner_groups(&self, owner: &OwnerId) -> Result<HashSet<String>> {
        let st = self.state.lock().await;
        Ok(st
            .contacts
            .iter()
            .filter(|c| &c.owner == owner)
            .flat_map(|c| c.groups.iter().cloned())
            .collect())
    }

    async fn find_contacts(&self, owner: &OwnerId, groups: &[String]) -> Result<Vec<Contact>> {
        let st = self.state.lock().await;
        Ok(st
            .contacts
            .iter()
            .filter(|c| &c.owner == owner && c.groups.iter().any(|g| groups.contains(g)))
            .cloned()
            .collect())
    }

    async fn count_contacts(&self, owner: &OwnerId, groups: &[String]) -> Result<usize> {
        Ok(self.find_contacts(owner, groups).await?.len())
    }

    async fn find_contacts_by_phone(&self, phone: &PhoneNumber) -> Result<Vec<Contact>> {
        let st = self.state.lock().await;
        Ok(st
            .contacts
            .iter()
            .filter(|c| &c.phone_number == phone)
            .cloned()
            .collect())
    }

    async fn find_opt_outs(&self, owners: &[OwnerId]) -> Result<HashSet<PhoneNumber>> {
        let st = self.state.lock().await;
        Ok(st
            .opt_outs
            .iter()
            .filter(|o| o.scope == OptOutScope::Platform || owners.contains(&o.owner))
            .map(|o| o.phone_number.clone())
            .collect())
    }

    async fn insert_opt_out(&self, entry: OptOutEntry) -> Result<bool> {
        let mut st = self.state.lock().await;
        let exists = st
            .opt_outs
            .iter()
            .any(|o| o.phone_number == entry.phone_number && o.owner == entry.owner);
        if exists {
            return Ok(false);
        }
        st.opt_outs.push(entry);
        Ok(true)
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert_campaign(&self, campaign: Campaign) -> Result<()> {
        campaign.validate()?;
        let mut st = self.state.lock().await;
        if st.campaigns.iter().any(|c| c.name == campaign.name) {
            return Err(Error::Validation(format!(
                "campaign name '{}' already exists",
                campaign.name
            )));
        }
        st.campaigns.push(campaign);
        Ok(())
    }

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>> {
        let st = self.state.lock().await;
        Ok(st.campaigns.iter().find(|c| &c.id == id).cloned())
    }

    async fn campaigns_by_sender(&self, sender: &PhoneNumber) -> Result<Vec<Campaign>> {
        let st = self.state.lock().await;
        Ok(st
            .campaigns
            .iter()
            .filter(|c| &c.sender == sender)
            .cloned()
            .collect())
    }

    async fn campaigns_by_owner(&self, owner: &OwnerId) -> Result<Vec<Campaign>> {
        let st = self.state.lock().await;
        Ok(st
            .campaigns
            .iter()
            .filter(|c| &c.owner == owner)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_queue_entries(&self, entries: Vec<QueueEntry>) -> Result<()> {
        let mut st = self.state.lock().await;
        for e in &entries {
            if st.queue.iter().any(|q| q.id == e.id) {
                return Err(Error::Storage(format!("duplicate queue entry id {}", e.id)));
            }
        }
        st.queue.extend(entries);
        Ok(())
    }

    async fn get_queue_entry(&self, id: &QueueEntryId) -> Result<Option<QueueEntry>> {
        let st = self.state.lock().await;
        Ok(st.queue.iter().find(|q| &q.id == id).cloned())
    }

    async fn update_queue_entry(
        &self,
        id: &QueueEntryId,
        expected: &[QueueStatus],
        patch: QueuePatch,
    ) -> Result<Option<QueueEntry>> {
        let mut st = self.state.lock().await;
        let Some(entry) = st.queue.iter_mut().find(|q| &q.id == id) else {
            return Err(Error::NotFound(format!("queue entry {id}")));
        };
        if !expected.contains(&entry.status) {
            return Ok(None);
        }
        // Validate on a copy so a rejected patch leaves the entry untouched.
        let mut next = entry.clone();
        next.apply_patch(&patch)?;
        *entry = next.clone();
        Ok(Some(next))
    }

    async fn queue_entries_for_owner(&self, owner: &OwnerId) -> Result<Vec<QueueEntry>> {
        let st = self.state.lock().await;
        let mut out: Vec<QueueEntry> = st
            .queue
            .iter()
            .filter(|q| &q.owner == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        Ok(out)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_messages(&self, records: Vec<MessageRecord>) -> Result<()> {
        self.state.lock().await.messages.extend(records);
        Ok(())
    }

    async fn insert_reply(&self, record: MessageRecord) -> Result<bool> {
        let mut st = self.state.lock().await;
        if let Some(key) = record.reply_key() {
            if st.messages.iter().any(|m| m.reply_key() == Some(key)) {
                return Ok(false);
            }
        }
        st.messages.push(record);
        Ok(true)
    }

    async fn set_message_status(
        &self,
        sender: &PhoneNumber,
        recipient: &PhoneNumber,
        external_id: &str,
        status: DeliveryStatus,
    ) -> Result<StatusUpdate> {
        let mut st = self.state.lock().await;
        let found = st.messages.iter_mut().find(|m| {
            &m.sender == sender
                && &m.recipient == recipient
                && m.external_id.as_deref() == Some(external_id)
        });
        Ok(match found {
            None => StatusUpdate::Unmatched,
            Some(m) if m.status == status => StatusUpdate::Unchanged,
            Some(m) => {
                m.status = status;
                StatusUpdate::Applied
            }
        })
    }

    async fn thread(
        &self,
        campaign: &CampaignId,
        phone: &PhoneNumber,
    ) -> Result<Vec<MessageRecord>> {
        let st = self.state.lock().await;
        let mut out: Vec<MessageRecord> = st
            .messages
            .iter()
            .filter(|m| {
                m.campaigns.contains(campaign) && (&m.recipient == phone || &m.sender == phone)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        Ok(out)
    }
}
