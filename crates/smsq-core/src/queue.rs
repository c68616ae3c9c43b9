//! Queue entries and their state machine.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    campaign::Campaign,
    domain::{CampaignId, OwnerId, QueueEntryId, TaskId},
    errors::Error,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Scheduled,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// `scheduled` and `paused` are the only states a new execution may start from.
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Scheduled | Self::Paused)
    }

    /// Legal transitions. `in_progress -> in_progress` covers progress writes and a
    /// resumed execution re-claiming its entry.
    pub fn can_transition(self, to: QueueStatus) -> bool {
        use QueueStatus::*;
        match self {
            Scheduled => matches!(to, InProgress | Cancelled),
            InProgress => matches!(to, InProgress | Paused | Completed | Failed | Cancelled),
            Paused => matches!(to, InProgress | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!("unknown queue status: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub campaign: CampaignId,
    pub owner: OwnerId,
    pub status: QueueStatus,
    /// Next batch to send; batches `< current_batch` are done.
    pub current_batch: u32,
    pub total_batches: u32,
    pub scheduled_at: DateTime<Utc>,
    pub task: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// New `scheduled` entry. Fails when the audience is empty.
    pub fn new(
        id: QueueEntryId,
        campaign: &Campaign,
        eligible_recipients: usize,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Self> {
        let total_batches = campaign.total_batches(eligible_recipients);
        if total_batches == 0 {
            return Err(Error::EmptyAudience(campaign.id.to_string()));
        }
        let now = Utc::now();
        Ok(Self {
            id,
            campaign: campaign.id.clone(),
            owner: campaign.owner.clone(),
            status: QueueStatus::Scheduled,
            current_batch: 0,
            total_batches,
            scheduled_at,
            task: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply `patch` in place, enforcing the transition table and the progress bound.
    ///
    /// Shared by every `QueueStore` so the invariants hold regardless of backend.
    pub fn apply_patch(&mut self, patch: &QueuePatch) -> Result<()> {
        if let Some(to) = patch.status {
            if to != self.status && !self.status.can_transition(to) {
                return Err(Error::ControlConflict(format!(
                    "queue entry {} cannot move from {} to {}",
                    self.id, self.status, to
                )));
            }
        }
        if let Some(batch) = patch.current_batch {
            if batch > self.total_batches {
                return Err(Error::Validation(format!(
                    "queue entry {}: current_batch {} exceeds total_batches {}",
                    self.id, batch, self.total_batches
                )));
            }
            if batch < self.current_batch {
                return Err(Error::Validation(format!(
                    "queue entry {}: progress cannot move backwards ({} -> {})",
                    self.id, self.current_batch, batch
                )));
            }
        }

        if let Some(to) = patch.status {
            self.status = to;
        }
        if let Some(batch) = patch.current_batch {
            self.current_batch = batch;
        }
        if let Some(task) = &patch.task {
            self.task = Some(task.clone());
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Partial update of a queue entry. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueuePatch {
    pub status: Option<QueueStatus>,
    pub current_batch: Option<u32>,
    pub task: Option<TaskId>,
}

impl QueuePatch {
    pub fn status(status: QueueStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(current_batch: u32) -> Self {
        Self {
            current_batch: Some(current_batch),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{BatchSize, BufferTime, ThrottleLevel};

    fn campaign() -> Campaign {
        Campaign {
            id: "c1".into(),
            name: "promo".to_string(),
            contact_groups: vec!["vip".to_string()],
            message: "hi".to_string(),
            batch_size: BatchSize::Mini,
            buffer_time: BufferTime::Short,
            throttle: ThrottleLevel::High,
            sender: "100".into(),
            include_opt_out: true,
            owner: "o1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn creation_computes_batches_and_rejects_empty_audience() {
        let e = QueueEntry::new("q1".into(), &campaign(), 120, Utc::now()).unwrap();
        assert_eq!(e.total_batches, 3);
        assert_eq!(e.current_batch, 0);
        assert_eq!(e.status, QueueStatus::Scheduled);

        let err = QueueEntry::new("q2".into(), &campaign(), 0, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::EmptyAudience(_)));
    }

    #[test]
    fn terminal_states_reject_transitions() {
        for s in [QueueStatus::Completed, QueueStatus::Failed, QueueStatus::Cancelled] {
            for to in [QueueStatus::InProgress, QueueStatus::Paused, QueueStatus::Scheduled] {
                assert!(!s.can_transition(to), "{s} -> {to}");
            }
        }
        assert!(!QueueStatus::Scheduled.can_transition(QueueStatus::Paused));
        assert!(QueueStatus::Paused.can_transition(QueueStatus::Cancelled));
    }

    #[test]
    fn patch_enforces_progress_bounds() {
        let mut e = QueueEntry::new("q1".into(), &campaign(), 120, Utc::now()).unwrap();
        e.apply_patch(&QueuePatch::status(QueueStatus::InProgress)).unwrap();
        e.apply_patch(&QueuePatch::progress(2)).unwrap();
        assert!(e.apply_patch(&QueuePatch::progress(4)).is_err());
        assert!(e.apply_patch(&QueuePatch::progress(1)).is_err());
        assert_eq!(e.current_batch, 2);

        e.apply_patch(&QueuePatch::status(QueueStatus::Completed)).unwrap();
        let err = e
            .apply_patch(&QueuePatch::status(QueueStatus::InProgress))
            .unwrap_err();
        assert!(matches!(err, Error::ControlConflict(_)));
        assert_eq!(e.status, QueueStatus::Completed);
    }
}
