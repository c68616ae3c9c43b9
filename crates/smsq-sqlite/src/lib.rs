//! SQLite implementation of the store ports.
//!
//! One connection behind a mutex; every call runs on the blocking pool. Multi-row
//! writes and queue-entry compare-and-set run inside a transaction.

mod rows;
mod schema;

use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use smsq_core::{
    campaign::Campaign,
    domain::{CampaignId, Contact, OptOutEntry, Owner, OwnerId, PhoneNumber, QueueEntryId},
    errors::Error,
    message::{DeliveryStatus, MessageRecord, StatusUpdate},
    ports::{CampaignStore, ContactStore, MessageStore, QueueStore},
    queue::{QueueEntry, QueuePatch, QueueStatus},
    Result,
};

use rows::{from_json, scope_str, to_json, ts, CampaignRow, ContactRow, MessageRow, QueueRow};

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(format!("sqlite: {e}"))
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        tracing::info!(path = %path.display(), "opened sqlite store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite worker failed: {e}")))?
    }

    pub async fn add_owner(&self, owner: Owner) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO owners (id, parent) VALUES (?1, ?2)",
                params![owner.id.as_str(), owner.parent.as_ref().map(|p| p.to_string())],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn add_contact(&self, contact: Contact) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO contacts (owner, phone_number, name, groups) VALUES (?1, ?2, ?3, ?4)",
                params![
                    contact.owner.as_str(),
                    contact.phone_number.as_str(),
                    contact.name,
                    to_json(&contact.groups)?,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

fn owner_contacts(conn: &Connection, owner: &str) -> Result<Vec<Contact>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM contacts WHERE owner = ?1 ORDER BY rowid",
            ContactRow::COLUMNS
        ))
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![owner], ContactRow::read)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    rows.into_iter().map(ContactRow::into_contact).collect()
}

fn load_campaigns(conn: &Connection, filter: &str, arg: &str) -> Result<Vec<Campaign>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM campaigns WHERE {filter} = ?1 ORDER BY created_at",
            CampaignRow::COLUMNS
        ))
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![arg], CampaignRow::read)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    rows.into_iter().map(CampaignRow::into_campaign).collect()
}

/// `verb` is `INSERT` or `INSERT OR IGNORE`. Returns the number of rows written.
fn insert_message(conn: &Connection, verb: &str, m: &MessageRecord) -> Result<usize> {
    conn.execute(
        &format!(
            "{verb} INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            MessageRow::COLUMNS
        ),
        params![
            m.id.as_str(),
            m.external_id,
            m.sender.as_str(),
            m.recipient.as_str(),
            m.body,
            ts(&m.sent_at),
            m.direction.as_str(),
            m.content_kind.as_str(),
            m.status.as_str(),
            to_json(&m.campaigns)?,
            to_json(&m.owners)?,
            m.keyword,
        ],
    )
    .map_err(db_err)
}

fn load_queue_entry(conn: &Connection, id: &str) -> Result<Option<QueueEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM queue_entries WHERE id = ?1", QueueRow::COLUMNS),
        params![id],
        QueueRow::read,
    )
    .optional()
    .map_err(db_err)?
    .map(QueueRow::into_entry)
    .transpose()
}

#[async_trait]
impl ContactStore for SqliteStore {
    async fn find_owner(&self, owner: &OwnerId) -> Result<Option<Owner>> {
        let owner = owner.clone();
        self.call(move |conn| {
            let parent: Option<Option<String>> = conn
                .query_row(
                    "SELECT parent FROM owners WHERE id = ?1",
                    params![owner.as_str()],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err)?;
            Ok(parent.map(|parent| Owner {
                id: owner,
                parent: parent.map(|p| p.as_str().into()),
            }))
        })
        .await
    }

    async fn owner_groups(&self, owner: &OwnerId) -> Result<HashSet<String>> {
        let owner = owner.clone();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT groups FROM contacts WHERE owner = ?1")
                .map_err(db_err)?;
            let raw = stmt
                .query_map(params![owner.as_str()], |r| r.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            let mut groups = HashSet::new();
            for r in raw {
                groups.extend(from_json::<Vec<String>>(&r)?);
            }
            Ok(groups)
        })
        .await
    }

    async fn find_contacts(&self, owner: &OwnerId, groups: &[String]) -> Result<Vec<Contact>> {
        let owner = owner.clone();
        let groups = groups.to_vec();
        self.call(move |conn| {
            Ok(owner_contacts(conn, owner.as_str())?
                .into_iter()
                .filter(|c| c.groups.iter().any(|g| groups.contains(g)))
                .collect())
        })
        .await
    }

    async fn count_contacts(&self, owner: &OwnerId, groups: &[String]) -> Result<usize> {
        Ok(self.find_contacts(owner, groups).await?.len())
    }

    async fn find_contacts_by_phone(&self, phone: &PhoneNumber) -> Result<Vec<Contact>> {
        let phone = phone.clone();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM contacts WHERE phone_number = ?1 ORDER BY rowid",
                    ContactRow::COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![phone.as_str()], ContactRow::read)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(ContactRow::into_contact).collect()
        })
        .await
    }

    async fn find_opt_outs(&self, owners: &[OwnerId]) -> Result<HashSet<PhoneNumber>> {
        let owners: Vec<String> = owners.iter().map(|o| o.to_string()).collect();
        self.call(move |conn| {
            let placeholders = vec!["?"; owners.len()].join(", ");
            let sql = if owners.is_empty() {
                "SELECT phone_number FROM opt_outs WHERE scope = 'platform'".to_string()
            } else {
                format!(
                    "SELECT phone_number FROM opt_outs WHERE scope = 'platform' OR owner IN ({placeholders})"
                )
            };
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let phones = stmt
                .query_map(params_from_iter(owners.iter()), |r| r.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(phones.iter().map(|p| p.as_str().into()).collect())
        })
        .await
    }

    async fn insert_opt_out(&self, entry: OptOutEntry) -> Result<bool> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO opt_outs (phone_number, owner, reason, scope, added_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        entry.phone_number.as_str(),
                        entry.owner.as_str(),
                        entry.reason,
                        scope_str(entry.scope),
                        ts(&entry.added_at),
                    ],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl CampaignStore for SqliteStore {
    async fn insert_campaign(&self, campaign: Campaign) -> Result<()> {
        campaign.validate()?;
        self.call(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let taken: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM campaigns WHERE name = ?1",
                    params![campaign.name],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if taken.is_some() {
                return Err(Error::Validation(format!(
                    "campaign name '{}' already exists",
                    campaign.name
                )));
            }
            tx.execute(
                &format!(
                    "INSERT INTO campaigns ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    CampaignRow::COLUMNS
                ),
                params![
                    campaign.id.as_str(),
                    campaign.name,
                    campaign.owner.as_str(),
                    to_json(&campaign.contact_groups)?,
                    campaign.message,
                    u32::from(campaign.batch_size),
                    u32::from(campaign.buffer_time),
                    campaign.throttle.as_str(),
                    campaign.sender.as_str(),
                    campaign.include_opt_out,
                    ts(&campaign.created_at),
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)
        })
        .await
    }

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>> {
        let id = id.clone();
        self.call(move |conn| {
            Ok(load_campaigns(conn, "id", id.as_str())?.into_iter().next())
        })
        .await
    }

    async fn campaigns_by_sender(&self, sender: &PhoneNumber) -> Result<Vec<Campaign>> {
        let sender = sender.clone();
        self.call(move |conn| load_campaigns(conn, "sender", sender.as_str()))
            .await
    }

    async fn campaigns_by_owner(&self, owner: &OwnerId) -> Result<Vec<Campaign>> {
        let owner = owner.clone();
        self.call(move |conn| load_campaigns(conn, "owner", owner.as_str()))
            .await
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn insert_queue_entries(&self, entries: Vec<QueueEntry>) -> Result<()> {
        self.call(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for e in &entries {
                tx.execute(
                    &format!(
                        "INSERT INTO queue_entries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        QueueRow::COLUMNS
                    ),
                    params![
                        e.id.as_str(),
                        e.campaign.as_str(),
                        e.owner.as_str(),
                        e.status.as_str(),
                        e.current_batch,
                        e.total_batches,
                        ts(&e.scheduled_at),
                        e.task.as_ref().map(|t| t.to_string()),
                        ts(&e.created_at),
                        ts(&e.updated_at),
                    ],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)
        })
        .await
    }

    async fn get_queue_entry(&self, id: &QueueEntryId) -> Result<Option<QueueEntry>> {
        let id = id.clone();
        self.call(move |conn| load_queue_entry(conn, id.as_str())).await
    }

    async fn update_queue_entry(
        &self,
        id: &QueueEntryId,
        expected: &[QueueStatus],
        patch: QueuePatch,
    ) -> Result<Option<QueueEntry>> {
        let id = id.clone();
        let expected = expected.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let Some(mut entry) = load_queue_entry(&tx, id.as_str())? else {
                return Err(Error::NotFound(format!("queue entry {id}")));
            };
            if !expected.contains(&entry.status) {
                return Ok(None);
            }
            entry.apply_patch(&patch)?;
            tx.execute(
                "UPDATE queue_entries
                 SET status = ?2, current_batch = ?3, task = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    entry.id.as_str(),
                    entry.status.as_str(),
                    entry.current_batch,
                    entry.task.as_ref().map(|t| t.to_string()),
                    ts(&entry.updated_at),
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(Some(entry))
        })
        .await
    }

    async fn queue_entries_for_owner(&self, owner: &OwnerId) -> Result<Vec<QueueEntry>> {
        let owner = owner.clone();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM queue_entries WHERE owner = ?1 ORDER BY scheduled_at",
                    QueueRow::COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![owner.as_str()], QueueRow::read)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(QueueRow::into_entry).collect()
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_messages(&self, records: Vec<MessageRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.call(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for m in &records {
                insert_message(&tx, "INSERT", m)?;
            }
            tx.commit().map_err(db_err)
        })
        .await
    }

    async fn insert_reply(&self, record: MessageRecord) -> Result<bool> {
        // The partial unique index `messages_reply_once` makes a redelivery a no-op.
        self.call(move |conn| Ok(insert_message(conn, "INSERT OR IGNORE", &record)? == 1))
            .await
    }

    async fn set_message_status(
        &self,
        sender: &PhoneNumber,
        recipient: &PhoneNumber,
        external_id: &str,
        status: DeliveryStatus,
    ) -> Result<StatusUpdate> {
        let (sender, recipient, external_id) =
            (sender.clone(), recipient.clone(), external_id.to_string());
        self.call(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let current: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, status FROM messages
                     WHERE sender = ?1 AND recipient = ?2 AND external_id = ?3
                     LIMIT 1",
                    params![sender.as_str(), recipient.as_str(), external_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            let Some((id, old)) = current else {
                return Ok(StatusUpdate::Unmatched);
            };
            if old == status.as_str() {
                return Ok(StatusUpdate::Unchanged);
            }
            tx.execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(StatusUpdate::Applied)
        })
        .await
    }

    async fn thread(
        &self,
        campaign: &CampaignId,
        phone: &PhoneNumber,
    ) -> Result<Vec<MessageRecord>> {
        let (campaign, phone) = (campaign.clone(), phone.clone());
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM messages
                     WHERE (recipient = ?1 OR sender = ?1)
                       AND EXISTS (SELECT 1 FROM json_each(messages.campaigns) WHERE value = ?2)
                     ORDER BY sent_at",
                    MessageRow::COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![phone.as_str(), campaign.as_str()], MessageRow::read)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(MessageRow::into_record).collect()
        })
        .await
    }
}
