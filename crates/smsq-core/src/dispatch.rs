//! The batch-send loop of one queue-entry execution.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    campaign::Campaign,
    config::DispatchSettings,
    domain::{new_id, MessageRecordId, OwnerId, QueueEntryId, Recipient},
    errors::Error,
    message::{ContentKind, DeliveryStatus, Direction, MessageRecord},
    messaging::port::MessagingGateway,
    ports::{CampaignStore, MessageStore, QueueStore, Store},
    queue::{QueueEntry, QueuePatch, QueueStatus},
    resolver::RecipientResolver,
    runtime::{TaskContext, TaskSpec},
    Result,
};

pub struct DispatchWorker {
    store: Arc<dyn Store>,
    gateway: Arc<dyn MessagingGateway>,
    resolver: RecipientResolver,
    settings: DispatchSettings,
}

/// How a run ended without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Stop was signalled; status is left to whoever signalled.
    Stopped,
    /// Nobody left to send to; the entry was marked failed.
    EmptyAudience,
    /// Another execution owns the entry, or it is no longer startable.
    NotClaimed,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn MessagingGateway>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            resolver: RecipientResolver::new(Arc::clone(&store)),
            store,
            gateway,
            settings,
        }
    }

    /// Job for the task runtime that runs `entry` on behalf of `owner`.
    pub fn task(self: &Arc<Self>, entry: QueueEntryId, owner: OwnerId) -> TaskSpec {
        let worker = Arc::clone(self);
        TaskSpec::new(format!("dispatch:{entry}"), move |ctx| {
            let worker = Arc::clone(&worker);
            let entry = entry.clone();
            let owner = owner.clone();
            Box::pin(async move { worker.run(&entry, &owner, ctx).await.map(|_| ()) })
        })
    }

    /// Run one execution. Storage failures are returned for the runtime to retry; on the
    /// final attempt the entry is marked failed first.
    pub async fn run(
        &self,
        entry_id: &QueueEntryId,
        owner: &OwnerId,
        ctx: TaskContext,
    ) -> Result<RunOutcome> {
        let Some(entry) = self.claim(entry_id, owner, &ctx).await? else {
            return Ok(RunOutcome::NotClaimed);
        };

        match self.run_claimed(entry, &ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(Error::EmptyAudience(campaign)) => {
                tracing::warn!(queue_entry = %entry_id, %campaign, "no eligible recipients");
                self.mark_failed(entry_id).await?;
                Ok(RunOutcome::EmptyAudience)
            }
            Err(e) if e.is_retryable() && !ctx.is_final_attempt() => Err(e),
            Err(e) => {
                tracing::error!(queue_entry = %entry_id, task = %ctx.task_id, error = %e, "dispatch failed");
                if let Err(mark_err) = self.mark_failed(entry_id).await {
                    tracing::error!(queue_entry = %entry_id, error = %mark_err, "could not mark entry failed");
                }
                Err(e)
            }
        }
    }

    async fn run_claimed(&self, entry: QueueEntry, ctx: &TaskContext) -> Result<RunOutcome> {
        let campaign = self
            .store
            .get_campaign(&entry.campaign)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", entry.campaign)))?;

        let recipients = self.resolver.resolve(&campaign).await?;
        let batch_size = campaign.batch_size.get();
        match AudienceDrift::measure(recipients.len(), entry.total_batches, batch_size) {
            AudienceDrift::None => {}
            AudienceDrift::Grew { skipped } => tracing::warn!(
                queue_entry = %entry.id,
                eligible = recipients.len(),
                total_batches = entry.total_batches,
                skipped,
                "audience grew since the entry was queued; recipients past the last batch are skipped"
            ),
            AudienceDrift::Shrank { empty_batches } => tracing::warn!(
                queue_entry = %entry.id,
                eligible = recipients.len(),
                total_batches = entry.total_batches,
                empty_batches,
                "audience shrank since the entry was queued"
            ),
        }

        if let Err(e) = self
            .gateway
            .register_inbound_webhook(&campaign.sender, &self.settings.reply_callback_url)
            .await
        {
            tracing::warn!(sender = %campaign.sender, error = %e, "failed to register reply webhook");
        }

        tracing::info!(
            queue_entry = %entry.id,
            campaign = %campaign.id,
            task = %ctx.task_id,
            from_batch = entry.current_batch,
            total_batches = entry.total_batches,
            "dispatch started"
        );

        for batch in entry.current_batch..entry.total_batches {
            let start = (batch as usize * batch_size).min(recipients.len());
            let end = (start + batch_size).min(recipients.len());
            let slice = &recipients[start..end];

            let (records, stopped) = self.send_batch(&campaign, slice, &ctx.cancel).await;
            if !records.is_empty() {
                self.store.insert_messages(records).await?;
            }
            if stopped {
                tracing::info!(queue_entry = %entry.id, batch, "dispatch stopped mid-batch");
                return Ok(RunOutcome::Stopped);
            }

            // Progress is only written while someone may still resume from it.
            self.store
                .update_queue_entry(
                    &entry.id,
                    &[QueueStatus::InProgress, QueueStatus::Paused],
                    QueuePatch::progress(batch + 1),
                )
                .await?;
            tracing::info!(
                queue_entry = %entry.id,
                batch,
                sent = slice.len(),
                "batch complete"
            );

            let last = batch + 1 == entry.total_batches;
            if !last && !slice.is_empty() && pause(&ctx.cancel, campaign.buffer_time.duration()).await {
                return Ok(RunOutcome::Stopped);
            }
        }

        if ctx.is_stopped() {
            return Ok(RunOutcome::Stopped);
        }
        let done = self
            .store
            .update_queue_entry(
                &entry.id,
                &[QueueStatus::InProgress],
                QueuePatch::status(QueueStatus::Completed),
            )
            .await?;
        if done.is_none() {
            // Paused or cancelled after the last batch was written.
            return Ok(RunOutcome::Stopped);
        }
        tracing::info!(queue_entry = %entry.id, campaign = %campaign.id, "dispatch completed");
        Ok(RunOutcome::Completed)
    }

    /// Move the entry to `in_progress` under this execution's id.
    ///
    /// An entry already `in_progress` under the same id is accepted (retry, or a
    /// resume that recorded the new id first).
    async fn claim(
        &self,
        entry_id: &QueueEntryId,
        owner: &OwnerId,
        ctx: &TaskContext,
    ) -> Result<Option<QueueEntry>> {
        let entry = self
            .store
            .get_queue_entry(entry_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue entry {entry_id}")))?;
        if &entry.owner != owner {
            return Err(Error::NotFound(format!("queue entry {entry_id}")));
        }

        if entry.status == QueueStatus::InProgress && entry.task.as_ref() == Some(&ctx.task_id) {
            return Ok(Some(entry));
        }

        let claimed = self
            .store
            .update_queue_entry(
                entry_id,
                &[QueueStatus::Scheduled, QueueStatus::Paused],
                QueuePatch::status(QueueStatus::InProgress).with_task(ctx.task_id.clone()),
            )
            .await?;
        if claimed.is_none() {
            tracing::info!(
                queue_entry = %entry_id,
                status = %entry.status,
                task = %ctx.task_id,
                "entry not claimable; skipping"
            );
        }
        Ok(claimed)
    }

    /// Send one batch sequentially. Returns the records to persist and whether a stop
    /// was observed before the batch finished.
    async fn send_batch(
        &self,
        campaign: &Campaign,
        slice: &[Recipient],
        cancel: &CancellationToken,
    ) -> (Vec<MessageRecord>, bool) {
        let throttle = campaign.throttle.delay();
        let mut records = Vec::with_capacity(slice.len());
        for (i, recipient) in slice.iter().enumerate() {
            if cancel.is_cancelled() {
                return (records, true);
            }
            records.push(self.send_one(campaign, recipient).await);
            if i + 1 < slice.len() && pause(cancel, throttle).await {
                return (records, true);
            }
        }
        (records, false)
    }

    async fn send_one(&self, campaign: &Campaign, recipient: &Recipient) -> MessageRecord {
        let body = campaign.render_for(recipient);
        let external_id = match self
            .gateway
            .send(&campaign.sender, &recipient.phone_number, &body)
            .await
        {
            Ok(receipt) if receipt.is_accepted() => receipt.external_id,
            Ok(receipt) => {
                tracing::warn!(
                    campaign = %campaign.id,
                    to = %recipient.phone_number,
                    status_code = %receipt.status_code,
                    error = receipt.error_text.as_deref().unwrap_or(""),
                    "carrier rejected message"
                );
                None
            }
            Err(e) => {
                tracing::warn!(campaign = %campaign.id, to = %recipient.phone_number, error = %e, "send failed");
                None
            }
        };

        MessageRecord {
            id: MessageRecordId(new_id()),
            external_id,
            sender: campaign.sender.clone(),
            recipient: recipient.phone_number.clone(),
            body,
            sent_at: Utc::now(),
            direction: Direction::Sent,
            content_kind: ContentKind::Text,
            status: DeliveryStatus::Unknown,
            campaigns: vec![campaign.id.clone()],
            owners: vec![campaign.owner.clone()],
            keyword: None,
        }
    }

    async fn mark_failed(&self, entry_id: &QueueEntryId) -> Result<()> {
        self.store
            .update_queue_entry(
                entry_id,
                &[QueueStatus::InProgress],
                QueuePatch::status(QueueStatus::Failed),
            )
            .await?;
        Ok(())
    }
}

/// Difference between the audience an entry was planned for and the one resolved
/// at run time. Batch count is fixed at enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AudienceDrift {
    None,
    Grew { skipped: usize },
    Shrank { empty_batches: u32 },
}

impl AudienceDrift {
    fn measure(eligible: usize, total_batches: u32, batch_size: usize) -> Self {
        let planned = total_batches as usize * batch_size;
        if eligible > planned {
            return Self::Grew {
                skipped: eligible - planned,
            };
        }
        let needed = eligible.div_ceil(batch_size) as u32;
        if needed < total_batches {
            Self::Shrank {
                empty_batches: total_batches - needed,
            }
        } else {
            Self::None
        }
    }
}

/// Sleep for `d` unless stopped first. Returns `true` when stopped.
async fn pause(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = sleep(d) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RuntimeSettings,
        domain::TaskId,
        ports::ContactStore,
        runtime::{LocalTaskRuntime, TaskRuntime},
        store::MemoryStore,
        testing::{contact, phone, sample_campaign, seed_audience, FakeGateway, FlakyStore, SENDER},
    };

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: Arc<FakeGateway>,
        worker: DispatchWorker,
    }

    async fn harness(recipients: usize, batch_size: u32) -> (Harness, QueueEntry) {
        let store = Arc::new(MemoryStore::new());
        seed_audience(&store, "o1", recipients).await;
        let campaign = sample_campaign("c1", "o1", batch_size);
        store.insert_campaign(campaign.clone()).await.unwrap();
        let entry = QueueEntry::new("q1".into(), &campaign, recipients, Utc::now()).unwrap();
        store.insert_queue_entries(vec![entry.clone()]).await.unwrap();

        let gateway = Arc::new(FakeGateway::default());
        let worker = DispatchWorker::new(
            store.clone(),
            gateway.clone(),
            DispatchSettings {
                reply_callback_url: "https://example.test/messages/inbound".to_string(),
            },
        );
        (
            Harness {
                store,
                gateway,
                worker,
            },
            entry,
        )
    }

    struct FlakyHarness {
        store: Arc<FlakyStore>,
        gateway: Arc<FakeGateway>,
        worker: Arc<DispatchWorker>,
        entry: QueueEntry,
    }

    async fn flaky_harness(recipients: usize, batch_size: u32) -> FlakyHarness {
        let (h, entry) = harness(recipients, batch_size).await;
        let store = Arc::new(FlakyStore::new(h.store));
        let worker = Arc::new(DispatchWorker::new(
            store.clone(),
            h.gateway.clone(),
            DispatchSettings {
                reply_callback_url: "https://example.test/messages/inbound".to_string(),
            },
        ));
        FlakyHarness {
            store,
            gateway: h.gateway,
            worker,
            entry,
        }
    }

    fn ctx(task: &str) -> TaskContext {
        TaskContext {
            task_id: TaskId::from(task),
            attempt: 1,
            max_attempts: 3,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_every_batch_and_completes() {
        let (h, entry) = harness(120, 50).await;
        let outcome = h.worker.run(&entry.id, &"o1".into(), ctx("t1")).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let stored = h.store.get_queue_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert_eq!(stored.current_batch, 3);
        assert_eq!(stored.task, Some(TaskId::from("t1")));

        let sent = h.gateway.sent();
        assert_eq!(sent.len(), 120);
        assert_eq!(sent[0].text, format!("Hi Name {}", phone(0)));
        assert_eq!(h.gateway.registered()[0].0.as_str(), SENDER);

        let messages = h.store.messages().await;
        assert_eq!(messages.len(), 120);
        assert!(messages
            .iter()
            .all(|m| m.status == DeliveryStatus::Unknown && m.external_id.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sends_are_recorded_not_raised() {
        let (h, entry) = harness(3, 50).await;
        h.gateway.reject(&phone(0));
        h.gateway.fail(&phone(2));
        h.worker.run(&entry.id, &"o1".into(), ctx("t1")).await.unwrap();

        let messages = h.store.messages().await;
        assert_eq!(messages.len(), 3);
        let failed: Vec<_> = messages
            .iter()
            .filter(|m| m.is_failed_send())
            .map(|m| m.recipient.to_string())
            .collect();
        assert_eq!(failed, vec![phone(0), phone(2)]);
        let stored = h.store.get_queue_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_at_the_persisted_batch() {
        let (h, entry) = harness(120, 50).await;
        h.store
            .update_queue_entry(
                &entry.id,
                &[QueueStatus::Scheduled],
                QueuePatch::status(QueueStatus::InProgress),
            )
            .await
            .unwrap();
        h.store
            .update_queue_entry(&entry.id, &[QueueStatus::InProgress], QueuePatch::progress(2))
            .await
            .unwrap();
        h.store
            .update_queue_entry(
                &entry.id,
                &[QueueStatus::InProgress],
                QueuePatch::status(QueueStatus::Paused),
            )
            .await
            .unwrap();

        h.worker.run(&entry.id, &"o1".into(), ctx("t2")).await.unwrap();
        let sent: Vec<String> = h.gateway.sent().iter().map(|s| s.to.to_string()).collect();
        let expected: Vec<String> = (100..120).map(phone).collect();
        assert_eq!(sent, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_keeps_progress_and_status() {
        let (h, entry) = harness(120, 50).await;
        let ctx = ctx("t1");
        let cancel = ctx.cancel.clone();
        let gateway = h.gateway.clone();
        let stopper = tokio::spawn(async move {
            gateway.wait_for_sends(60).await;
            cancel.cancel();
        });

        let outcome = h.worker.run(&entry.id, &"o1".into(), ctx).await.unwrap();
        stopper.await.unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);

        let stored = h.store.get_queue_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.current_batch, 1);
        assert_eq!(stored.status, QueueStatus::InProgress);
        let recorded = h.store.messages().await.len();
        assert!((60..100).contains(&recorded), "recorded {recorded}");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_audience_fails_the_entry_without_retry() {
        let (h, entry) = harness(2, 50).await;
        for i in 0..2 {
            h.store
                .insert_opt_out(crate::domain::OptOutEntry {
                    phone_number: phone(i).as_str().into(),
                    reason: "test".to_string(),
                    scope: crate::domain::OptOutScope::Owner,
                    owner: "o1".into(),
                    added_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let outcome = h.worker.run(&entry.id, &"o1".into(), ctx("t1")).await.unwrap();
        assert_eq!(outcome, RunOutcome::EmptyAudience);
        let stored = h.store.get_queue_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert!(h.gateway.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_entries_are_not_claimed() {
        let (h, entry) = harness(5, 50).await;
        h.store
            .update_queue_entry(
                &entry.id,
                &[QueueStatus::Scheduled],
                QueuePatch::status(QueueStatus::Cancelled),
            )
            .await
            .unwrap();
        let outcome = h.worker.run(&entry.id, &"o1".into(), ctx("t1")).await.unwrap();
        assert_eq!(outcome, RunOutcome::NotClaimed);
        assert!(h.gateway.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_before_the_last_attempt_is_returned_for_retry() {
        let h = flaky_harness(120, 50).await;
        h.store.fail_insert_calls([1]);

        let err = h
            .worker
            .run(&h.entry.id, &"o1".into(), ctx("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(err.is_retryable());

        let stored = h.store.get_queue_entry(&h.entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::InProgress);
        assert_eq!(stored.current_batch, 0);
        assert_eq!(stored.task, Some(TaskId::from("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_on_the_last_attempt_fails_the_entry() {
        let h = flaky_harness(120, 50).await;
        h.store.fail_insert_calls([1]);
        let mut last = ctx("t1");
        last.attempt = last.max_attempts;

        let err = h
            .worker
            .run(&h.entry.id, &"o1".into(), last)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let stored = h.store.get_queue_entry(&h.entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(h.gateway.sent().len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_retry_resumes_from_the_persisted_batch() {
        let h = flaky_harness(60, 50).await;
        // Batch 0 is stored; the write of batch 1 fails once.
        h.store.fail_insert_calls([2]);
        let runtime = LocalTaskRuntime::new(RuntimeSettings {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        });

        let task = runtime
            .schedule(h.worker.task(h.entry.id.clone(), "o1".into()), Duration::ZERO)
            .await
            .unwrap();
        runtime.join(&task).await;

        let stored = h.store.get_queue_entry(&h.entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert_eq!(stored.current_batch, 2);
        assert_eq!(stored.task, Some(task));

        let sent: Vec<String> = h.gateway.sent().iter().map(|s| s.to.to_string()).collect();
        assert_eq!(sent.len(), 70);
        for i in 0..50 {
            assert_eq!(sent.iter().filter(|p| **p == phone(i)).count(), 1, "{}", phone(i));
        }
        for i in 50..60 {
            assert_eq!(sent.iter().filter(|p| **p == phone(i)).count(), 2, "{}", phone(i));
        }
        assert_eq!(h.store.inner.messages().await.len(), 60);
    }

    #[test]
    fn audience_drift_counts_what_the_plan_cannot_reach() {
        assert_eq!(AudienceDrift::measure(120, 3, 50), AudienceDrift::None);
        assert_eq!(AudienceDrift::measure(150, 3, 50), AudienceDrift::None);
        assert_eq!(
            AudienceDrift::measure(163, 3, 50),
            AudienceDrift::Grew { skipped: 13 }
        );
        assert_eq!(
            AudienceDrift::measure(40, 3, 50),
            AudienceDrift::Shrank { empty_batches: 2 }
        );
        assert_eq!(
            AudienceDrift::measure(0, 1, 50),
            AudienceDrift::Shrank { empty_batches: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn grown_audience_stops_at_the_planned_batches() {
        let (h, entry) = harness(60, 50).await;
        assert_eq!(entry.total_batches, 2);
        for i in 60..115 {
            h.store.add_contact(contact("o1", &phone(i), &["vip"])).await;
        }

        let outcome = h.worker.run(&entry.id, &"o1".into(), ctx("t1")).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        let sent: Vec<String> = h.gateway.sent().iter().map(|s| s.to.to_string()).collect();
        assert_eq!(sent.len(), 100);
        assert_eq!(sent.last(), Some(&phone(99)));
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_owner_cannot_run_an_entry() {
        let (h, entry) = harness(5, 50).await;
        let err = h
            .worker
            .run(&entry.id, &"intruder".into(), ctx("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
