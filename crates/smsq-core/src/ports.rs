//! Storage ports. Adapters (`MemoryStore`, `smsq-sqlite`) implement these.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::{
    campaign::Campaign,
    domain::{CampaignId, Contact, OptOutEntry, Owner, OwnerId, PhoneNumber, QueueEntryId},
    message::{DeliveryStatus, MessageRecord, StatusUpdate},
    queue::{QueueEntry, QueuePatch, QueueStatus},
    Result,
};

/// Contacts and opt-out lists (owned by the CRUD layer; read here).
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn find_owner(&self, owner: &OwnerId) -> Result<Option<Owner>>;

    /// Groups that currently have at least one contact for `owner`.
    async fn owner_groups(&self, owner: &OwnerId) -> Result<HashSet<String>>;

    /// Contacts of `owner` in any of `groups`, in insertion order.
    async fn find_contacts(&self, owner: &OwnerId, groups: &[String]) -> Result<Vec<Contact>>;

    async fn count_contacts(&self, owner: &OwnerId, groups: &[String]) -> Result<usize>;

    /// Contacts with this number across all owners.
    async fn find_contacts_by_phone(&self, phone: &PhoneNumber) -> Result<Vec<Contact>>;

    /// Numbers opted out for any of `owners`, plus every platform-scoped entry.
    async fn find_opt_outs(&self, owners: &[OwnerId]) -> Result<HashSet<PhoneNumber>>;

    /// Returns `false` when `(phone_number, owner)` already exists.
    async fn insert_opt_out(&self, entry: OptOutEntry) -> Result<bool>;
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Rejects invalid campaigns and duplicate names with `Error::Validation`.
    async fn insert_campaign(&self, campaign: Campaign) -> Result<()>;

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>>;

    async fn campaigns_by_sender(&self, sender: &PhoneNumber) -> Result<Vec<Campaign>>;

    async fn campaigns_by_owner(&self, owner: &OwnerId) -> Result<Vec<Campaign>>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// All-or-nothing.
    async fn insert_queue_entries(&self, entries: Vec<QueueEntry>) -> Result<()>;

    async fn get_queue_entry(&self, id: &QueueEntryId) -> Result<Option<QueueEntry>>;

    /// Atomic compare-and-set: applies `patch` only while the entry's status is one of
    /// `expected`. Returns the updated entry, or `None` when the guard did not hold.
    async fn update_queue_entry(
        &self,
        id: &QueueEntryId,
        expected: &[QueueStatus],
        patch: QueuePatch,
    ) -> Result<Option<QueueEntry>>;

    async fn queue_entries_for_owner(&self, owner: &OwnerId) -> Result<Vec<QueueEntry>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_messages(&self, records: Vec<MessageRecord>) -> Result<()>;

    /// Store an inbound reply unless one with the same [`MessageRecord::reply_key`]
    /// exists. Returns `false` for a redelivery.
    async fn insert_reply(&self, record: MessageRecord) -> Result<bool>;

    async fn set_message_status(
        &self,
        sender: &PhoneNumber,
        recipient: &PhoneNumber,
        external_id: &str,
        status: DeliveryStatus,
    ) -> Result<StatusUpdate>;

    /// Messages tied to `campaign` exchanged with `phone`, ordered by `sent_at`.
    async fn thread(&self, campaign: &CampaignId, phone: &PhoneNumber)
        -> Result<Vec<MessageRecord>>;
}

/// Everything the engine persists, as one trait object.
pub trait Store: ContactStore + CampaignStore + QueueStore + MessageStore {}

impl<T> Store for T where T: ContactStore + CampaignStore + QueueStore + MessageStore {}
