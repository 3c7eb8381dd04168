//! Scheduled message deletions (store `scheduled-deletions`).
//!
//! Used for transient bot messages such as rank-up announcements.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::keystore::{Clock, Keystore, MessageBackend};
use crate::ledger::{parse_id, LedgerCore};

pub const STORE: &str = "scheduled-deletions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledDeletion {
    pub guild_id: String,
    pub channel_id: String,
    pub message_id: String,
    /// Unix milliseconds.
    pub delete_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeletionQueue {
    #[serde(default)]
    messages: Vec<ScheduledDeletion>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionRun {
    pub deleted: usize,
    /// Due entries whose delete failed; they are dropped all the same.
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionStats {
    pub total: usize,
    pub pending: usize,
    pub overdue: usize,
}

#[derive(Debug, Clone)]
pub struct DeletionLedger {
    core: LedgerCore,
}

impl DeletionLedger {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self {
            core: LedgerCore::new(keystore, STORE),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.core.clock = clock;
        self
    }

    pub async fn schedule(&self, guild_id: u64, channel_id: u64, message_id: u64, delay: Duration) {
        let now = self.core.now();
        let entry = ScheduledDeletion {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            delete_at: now + delay.as_millis() as i64,
            created_at: now,
        };

        let _guard = self.core.keystore.lock_store(STORE).await;
        let mut queue: DeletionQueue = self.core.load();
        queue.messages.push(entry);
        self.core.save(&queue);
        tracing::debug!(
            "Scheduled message {} for deletion in {}s",
            message_id,
            delay.as_secs()
        );
    }

    /// Delete every message whose time has come. Due entries leave the
    /// queue whatever the outcome of their delete.
    pub async fn process_due(&self, messages: &dyn MessageBackend) -> DeletionRun {
        let _guard = self.core.keystore.lock_store(STORE).await;
        let queue: DeletionQueue = self.core.load();
        if queue.messages.is_empty() {
            return DeletionRun::default();
        }

        let now = self.core.now();
        let (due, remaining): (Vec<_>, Vec<_>) = queue
            .messages
            .into_iter()
            .partition(|entry| now >= entry.delete_at);
        if due.is_empty() {
            return DeletionRun {
                remaining: remaining.len(),
                ..Default::default()
            };
        }

        let mut run = DeletionRun {
            remaining: remaining.len(),
            ..Default::default()
        };
        for entry in &due {
            let (Some(channel_id), Some(message_id)) =
                (parse_id(&entry.channel_id), parse_id(&entry.message_id))
            else {
                run.failed += 1;
                continue;
            };
            match messages.delete_message(channel_id, message_id).await {
                Ok(()) => run.deleted += 1,
                Err(BackendError::NotFound(_)) => {
                    tracing::debug!("Message {} already deleted", message_id);
                    run.deleted += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to delete message {}: {}", message_id, e);
                    run.failed += 1;
                }
            }
        }

        self.core.save(&DeletionQueue {
            messages: remaining,
        });
        if run.deleted > 0 {
            tracing::info!(
                "Auto-deleted {} message(s), {} remaining",
                run.deleted,
                run.remaining
            );
        }
        run
    }

    pub fn stats(&self) -> DeletionStats {
        let queue: DeletionQueue = self.core.load();
        let now = self.core.now();
        let total = queue.messages.len();
        let overdue = queue
            .messages
            .iter()
            .filter(|entry| entry.delete_at <= now)
            .count();
        DeletionStats {
            total,
            pending: total - overdue,
            overdue,
        }
    }
}
