//! Operator-facing control of queue entries: enqueue, pause, cancel, resume.
//!
//! Every action checks the stored execution handle against the task runtime, applies
//! the status change as a compare-and-set, and reads the entry back before reporting.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    campaign::Campaign,
    dispatch::DispatchWorker,
    domain::{new_id, CampaignId, OwnerId, QueueEntryId, TaskId},
    errors::Error,
    ports::{CampaignStore, ContactStore, QueueStore, Store},
    queue::{QueueEntry, QueuePatch, QueueStatus},
    resolver::RecipientResolver,
    runtime::{TaskRuntime, TaskState},
    Result,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub campaign: CampaignId,
    /// Absent or in the past means "now".
    #[serde(default)]
    pub schedule_at: Option<DateTime<Utc>>,
}

pub struct ControlChannel {
    store: Arc<dyn Store>,
    runtime: Arc<dyn TaskRuntime>,
    worker: Arc<DispatchWorker>,
    resolver: RecipientResolver,
}

impl ControlChannel {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn TaskRuntime>,
        worker: Arc<DispatchWorker>,
    ) -> Self {
        Self {
            resolver: RecipientResolver::new(Arc::clone(&store)),
            store,
            runtime,
            worker,
        }
    }

    /// Queue one execution per request. Nothing is inserted unless every campaign
    /// exists, belongs to `owner` and has at least one eligible recipient.
    pub async fn enqueue(
        &self,
        owner: &OwnerId,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<QueueEntry>> {
        if requests.is_empty() {
            return Err(Error::Validation("no campaigns to queue".to_string()));
        }

        let mut campaigns: Vec<(Campaign, Option<DateTime<Utc>>)> = Vec::new();
        let mut missing = Vec::new();
        for req in requests {
            match self.store.get_campaign(&req.campaign).await? {
                Some(c) if &c.owner == owner => campaigns.push((c, req.schedule_at)),
                _ => missing.push(req.campaign.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::NotFound(format!(
                "campaign(s) not found: {}",
                missing.join(", ")
            )));
        }

        let now = Utc::now();
        let mut entries = Vec::with_capacity(campaigns.len());
        for (campaign, at) in &campaigns {
            campaign.validate()?;
            let in_groups = self
                .store
                .count_contacts(owner, &campaign.contact_groups)
                .await?;
            let eligible = self.resolver.resolve(campaign).await?.len();
            let scheduled_at = at.filter(|t| *t > now).unwrap_or(now);
            let entry = QueueEntry::new(
                QueueEntryId(new_id()),
                campaign,
                eligible,
                scheduled_at,
            )?;
            tracing::info!(
                queue_entry = %entry.id,
                campaign = %campaign.id,
                contacts = in_groups,
                eligible,
                total_batches = entry.total_batches,
                scheduled_at = %scheduled_at,
                "queue entry created"
            );
            entries.push(entry);
        }

        self.store.insert_queue_entries(entries.clone()).await?;

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let delay = (entry.scheduled_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let task = self
                .runtime
                .schedule(self.worker.task(entry.id.clone(), owner.clone()), delay)
                .await?;
            // The worker may already have claimed the entry under this same id.
            self.store
                .update_queue_entry(
                    &entry.id,
                    &[
                        QueueStatus::Scheduled,
                        QueueStatus::InProgress,
                        QueueStatus::Paused,
                    ],
                    QueuePatch {
                        task: Some(task),
                        ..QueuePatch::default()
                    },
                )
                .await?;
            out.push(self.owned_entry(owner, &entry.id).await?);
        }
        Ok(out)
    }

    pub async fn get(&self, owner: &OwnerId, id: &QueueEntryId) -> Result<QueueEntry> {
        self.owned_entry(owner, id).await
    }

    pub async fn list(&self, owner: &OwnerId) -> Result<Vec<QueueEntry>> {
        self.store.queue_entries_for_owner(owner).await
    }

    /// Stop a running execution at its next safe point and mark the entry paused.
    pub async fn pause(&self, owner: &OwnerId, id: &QueueEntryId) -> Result<QueueEntry> {
        let entry = self.owned_entry(owner, id).await?;
        if entry.status != QueueStatus::InProgress {
            return Err(conflict(&entry, "pause"));
        }
        let task = self.live_task(&entry, &[TaskState::Running]).await?;
        if !self.runtime.signal_stop(&task).await {
            return Err(conflict(&entry, "pause"));
        }

        self.store
            .update_queue_entry(
                id,
                &[QueueStatus::InProgress],
                QueuePatch::status(QueueStatus::Paused),
            )
            .await?;
        let confirmed = self.confirm(owner, id, QueueStatus::Paused, "pause").await?;
        tracing::info!(queue_entry = %id, task = %task, current_batch = confirmed.current_batch, "paused");
        Ok(confirmed)
    }

    pub async fn cancel(&self, owner: &OwnerId, id: &QueueEntryId) -> Result<QueueEntry> {
        let entry = self.owned_entry(owner, id).await?;
        match entry.status {
            QueueStatus::Paused => {
                // The paused execution is gone or winding down; nothing to wait for.
                if let Some(task) = &entry.task {
                    self.runtime.signal_stop(task).await;
                }
                self.store
                    .update_queue_entry(
                        id,
                        &[QueueStatus::Paused],
                        QueuePatch::status(QueueStatus::Cancelled),
                    )
                    .await?;
            }
            QueueStatus::Scheduled | QueueStatus::InProgress => {
                let task = self
                    .live_task(
                        &entry,
                        &[TaskState::Pending, TaskState::Running, TaskState::Retrying],
                    )
                    .await?;
                if !self.runtime.signal_stop(&task).await {
                    return Err(conflict(&entry, "cancel"));
                }
                self.store
                    .update_queue_entry(
                        id,
                        &[QueueStatus::Scheduled, QueueStatus::InProgress],
                        QueuePatch::status(QueueStatus::Cancelled),
                    )
                    .await?;
            }
            _ => return Err(conflict(&entry, "cancel")),
        }

        let confirmed = self
            .confirm(owner, id, QueueStatus::Cancelled, "cancel")
            .await?;
        tracing::info!(queue_entry = %id, current_batch = confirmed.current_batch, "cancelled");
        Ok(confirmed)
    }

    /// Start a new execution from the persisted `current_batch`.
    ///
    /// On a paused entry the previous execution must have exited. On a scheduled entry
    /// whose execution is still waiting, that execution is stopped and the entry starts
    /// now.
    pub async fn resume(&self, owner: &OwnerId, id: &QueueEntryId) -> Result<QueueEntry> {
        let entry = self.owned_entry(owner, id).await?;
        match entry.status {
            QueueStatus::Paused => {
                if let Some(old) = &entry.task {
                    if let Some(state) = self.runtime.state(old).await.filter(|s| s.is_live()) {
                        return Err(Error::ControlConflict(format!(
                            "queue entry {id}: previous execution {old} is still {state:?}"
                        )));
                    }
                }
            }
            QueueStatus::Scheduled => {
                let old = self.live_task(&entry, &[TaskState::Pending]).await?;
                if !self.runtime.signal_stop(&old).await {
                    return Err(conflict(&entry, "resume"));
                }
            }
            _ => return Err(conflict(&entry, "resume")),
        }

        let task = self
            .runtime
            .schedule(self.worker.task(id.clone(), owner.clone()), Duration::ZERO)
            .await?;
        self.store
            .update_queue_entry(
                id,
                &[
                    QueueStatus::Paused,
                    QueueStatus::Scheduled,
                    QueueStatus::InProgress,
                ],
                QueuePatch::status(QueueStatus::InProgress).with_task(task.clone()),
            )
            .await?;

        // Either our write or the new execution's own claim records the new handle.
        let current = self.owned_entry(owner, id).await?;
        if current.task.as_ref() != Some(&task) {
            self.runtime.signal_stop(&task).await;
            return Err(conflict(&current, "resume"));
        }
        tracing::info!(queue_entry = %id, task = %task, from_batch = current.current_batch, "resumed");
        Ok(current)
    }

    async fn owned_entry(&self, owner: &OwnerId, id: &QueueEntryId) -> Result<QueueEntry> {
        match self.store.get_queue_entry(id).await? {
            Some(e) if &e.owner == owner => Ok(e),
            _ => Err(Error::NotFound(format!("queue entry {id}"))),
        }
    }

    /// The entry's execution handle, if the runtime reports it in one of `allowed`.
    async fn live_task(&self, entry: &QueueEntry, allowed: &[TaskState]) -> Result<TaskId> {
        let Some(task) = entry.task.clone() else {
            return Err(Error::ControlConflict(format!(
                "queue entry {} has no execution handle",
                entry.id
            )));
        };
        match self.runtime.state(&task).await {
            Some(state) if allowed.contains(&state) => Ok(task),
            Some(state) => Err(Error::ControlConflict(format!(
                "queue entry {}: execution {task} is {state:?}",
                entry.id
            ))),
            None => Err(Error::ControlConflict(format!(
                "queue entry {}: execution {task} not found",
                entry.id
            ))),
        }
    }

    async fn confirm(
        &self,
        owner: &OwnerId,
        id: &QueueEntryId,
        expected: QueueStatus,
        action: &str,
    ) -> Result<QueueEntry> {
        let entry = self.owned_entry(owner, id).await?;
        if entry.status != expected {
            return Err(conflict(&entry, action));
        }
        Ok(entry)
    }
}

fn conflict(entry: &QueueEntry, action: &str) -> Error {
    Error::ControlConflict(format!(
        "cannot {action} queue entry {} in status {}",
        entry.id, entry.status
    ))
}
