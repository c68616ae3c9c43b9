//! Shared fakes and fixtures for the core's unit tests.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use crate::{
    campaign::{BatchSize, BufferTime, Campaign, ThrottleLevel},
    domain::{CampaignId, Contact, OptOutEntry, Owner, OwnerId, PhoneNumber, QueueEntryId},
    errors::Error,
    message::{DeliveryStatus, MessageRecord, StatusUpdate},
    messaging::{port::MessagingGateway, types::SendReceipt},
    ports::{CampaignStore, ContactStore, MessageStore, QueueStore},
    queue::{QueueEntry, QueuePatch, QueueStatus},
    store::MemoryStore,
    Result,
};

pub const SENDER: &str = "12013816708";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentSms {
    pub from: PhoneNumber,
    pub to: PhoneNumber,
    pub text: String,
}

pub struct FakeGateway {
    sent: Mutex<Vec<SentSms>>,
    registered: Mutex<Vec<(PhoneNumber, String)>>,
    rejected: Mutex<HashSet<PhoneNumber>>,
    unreachable: Mutex<HashSet<PhoneNumber>>,
    sends: watch::Sender<usize>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            unreachable: Mutex::new(HashSet::new()),
            sends: watch::channel(0).0,
        }
    }
}

impl FakeGateway {
    pub fn sent(&self) -> Vec<SentSms> {
        self.sent.lock().unwrap().clone()
    }

    pub fn registered(&self) -> Vec<(PhoneNumber, String)> {
        self.registered.lock().unwrap().clone()
    }

    /// Carrier answers with a non-zero status for this number.
    pub fn reject(&self, to: &str) {
        self.rejected.lock().unwrap().insert(to.into());
    }

    /// Transport error for this number.
    pub fn fail(&self, to: &str) {
        self.unreachable.lock().unwrap().insert(to.into());
    }

    /// Resolves once at least `n` sends were attempted.
    pub async fn wait_for_sends(&self, n: usize) {
        let mut rx = self.sends.subscribe();
        let _ = rx.wait_for(|c| *c >= n).await;
    }
}

#[async_trait]
impl MessagingGateway for FakeGateway {
    async fn send(&self, from: &PhoneNumber, to: &PhoneNumber, text: &str) -> Result<SendReceipt> {
        self.sends.send_modify(|c| *c += 1);
        if self.unreachable.lock().unwrap().contains(to) {
            return Err(Error::Gateway(format!("connection reset sending to {to}")));
        }
        if self.rejected.lock().unwrap().contains(to) {
            return Ok(SendReceipt::rejected("6", "Invalid Message"));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentSms {
            from: from.clone(),
            to: to.clone(),
            text: text.to_string(),
        });
        Ok(SendReceipt::accepted(format!("ext-{}", sent.len())))
    }

    async fn register_inbound_webhook(
        &self,
        sender: &PhoneNumber,
        callback_url: &str,
    ) -> Result<()> {
        self.registered
            .lock()
            .unwrap()
            .push((sender.clone(), callback_url.to_string()));
        Ok(())
    }
}

pub fn contact(owner: &str, phone: &str, groups: &[&str]) -> Contact {
    Contact {
        owner: owner.into(),
        phone_number: phone.into(),
        name: format!("Name {phone}"),
        groups: groups.iter().map(|g| g.to_string()).collect(),
    }
}

pub fn sample_campaign(id: &str, owner: &str, batch_size: u32) -> Campaign {
    Campaign {
        id: id.into(),
        name: format!("campaign {id}"),
        contact_groups: vec!["vip".to_string()],
        message: "Hi {name}".to_string(),
        batch_size: BatchSize::try_from(batch_size).unwrap(),
        buffer_time: BufferTime::Short,
        throttle: ThrottleLevel::High,
        sender: SENDER.into(),
        include_opt_out: true,
        owner: owner.into(),
        created_at: Utc::now(),
    }
}

pub fn phone(i: usize) -> String {
    format!("1555{i:07}")
}

/// `n` contacts in group `vip` for `owner`.
pub async fn seed_audience(store: &MemoryStore, owner: &str, n: usize) {
    for i in 0..n {
        store.add_contact(contact(owner, &phone(i), &["vip"])).await;
    }
}

/// `MemoryStore` whose `insert_messages` fails with `Error::Storage` on chosen calls.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    /// 1-based call numbers of `insert_messages` that fail.
    failing_inserts: Mutex<HashSet<u32>>,
    insert_calls: Mutex<u32>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_inserts: Mutex::new(HashSet::new()),
            insert_calls: Mutex::new(0),
        }
    }

    pub fn fail_insert_calls(&self, calls: impl IntoIterator<Item = u32>) {
        self.failing_inserts.lock().unwrap().extend(calls);
    }
}

#[async_trait]
impl ContactStore for FlakyStore {
    async fn find_owner(&self, owner: &OwnerId) -> Result<Option<Owner>> {
        self.inner.find_owner(owner).await
    }

    async fn owner_groups(&self, owner: &OwnerId) -> Result<HashSet<String>> {
        self.inner.owner_groups(owner).await
    }

    async fn find_contacts(&self, owner: &OwnerId, groups: &[String]) -> Result<Vec<Contact>> {
        self.inner.find_contacts(owner, groups).await
    }

    async fn count_contacts(&self, owner: &OwnerId, groups: &[String]) -> Result<usize> {
        self.inner.count_contacts(owner, groups).await
    }

    async fn find_contacts_by_phone(&self, phone: &PhoneNumber) -> Result<Vec<Contact>> {
        self.inner.find_contacts_by_phone(phone).await
    }

    async fn find_opt_outs(&self, owners: &[OwnerId]) -> Result<HashSet<PhoneNumber>> {
        self.inner.find_opt_outs(owners).await
    }

    async fn insert_opt_out(&self, entry: OptOutEntry) -> Result<bool> {
        self.inner.insert_opt_out(entry).await
    }
}

#[async_trait]
impl CampaignStore for FlakyStore {
    async fn insert_campaign(&self, campaign: Campaign) -> Result<()> {
        self.inner.insert_campaign(campaign).await
    }

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>> {
        self.inner.get_campaign(id).await
    }

    async fn campaigns_by_sender(&self, sender: &PhoneNumber) -> Result<Vec<Campaign>> {
        self.inner.campaigns_by_sender(sender).await
    }

    async fn campaigns_by_owner(&self, owner: &OwnerId) -> Result<Vec<Campaign>> {
        self.inner.campaigns_by_owner(owner).await
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn insert_queue_entries(&self, entries: Vec<QueueEntry>) -> Result<()> {
        self.inner.insert_queue_entries(entries).await
    }

    async fn get_queue_entry(&self, id: &QueueEntryId) -> Result<Option<QueueEntry>> {
        self.inner.get_queue_entry(id).await
    }

    async fn update_queue_entry(
        &self,
        id: &QueueEntryId,
        expected: &[QueueStatus],
        patch: QueuePatch,
    ) -> Result<Option<QueueEntry>> {
        self.inner.update_queue_entry(id, expected, patch).await
    }

    async fn queue_entries_for_owner(&self, owner: &OwnerId) -> Result<Vec<QueueEntry>> {
        self.inner.queue_entries_for_owner(owner).await
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn insert_messages(&self, records: Vec<MessageRecord>) -> Result<()> {
        let call = {
            let mut calls = self.insert_calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if self.failing_inserts.lock().unwrap().contains(&call) {
            return Err(Error::Storage(format!("database is locked (insert call {call})")));
        }
        self.inner.insert_messages(records).await
    }

    async fn insert_reply(&self, record: MessageRecord) -> Result<bool> {
        self.inner.insert_reply(record).await
    }

    async fn set_message_status(
        &self,
        sender: &PhoneNumber,
        recipient: &PhoneNumber,
        external_id: &str,
        status: DeliveryStatus,
    ) -> Result<StatusUpdate> {
        self.inner
            .set_message_status(sender, recipient, external_id, status)
            .await
    }

    async fn thread(
        &self,
        campaign: &CampaignId,
        phone: &PhoneNumber,
    ) -> Result<Vec<MessageRecord>> {
        self.inner.thread(campaign, phone).await
    }
}
