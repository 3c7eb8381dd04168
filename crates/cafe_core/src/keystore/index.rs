//! Store index - rebuilds stores from the backing channel's history
//!
//! Also the self-healing step: when several writers left records for the
//! same store, only the write with the newest timestamp survives and every
//! older record is deleted.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::keystore::backend::{MessageBackend, StoredMessage};
use crate::keystore::codec::{self, ChunkRecord};

/// Options for a reconstruction pass.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub history_limit: usize,
    /// Pause between consecutive deletes.
    pub write_delay: Duration,
}

/// A store rebuilt from its records.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedStore {
    pub data: JsonValue,
    pub backing_message_ids: Vec<u64>,
}

/// Result of a reconstruction pass.
#[derive(Debug, Default)]
pub struct Reconstruction {
    pub stores: BTreeMap<String, LoadedStore>,
    pub duplicates_removed: usize,
    /// Bot messages that did not parse as records.
    pub skipped: usize,
}

#[derive(Debug)]
struct Candidate {
    message_id: u64,
    record: ChunkRecord,
}

/// Bot-authored messages that parse as records, with the count of those
/// that did not.
pub(crate) fn collect_records(
    messages: Vec<StoredMessage>,
    self_id: u64,
) -> (Vec<(u64, ChunkRecord)>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;
    for message in messages {
        if message.author_id != self_id || message.content.is_empty() {
            continue;
        }
        match codec::parse_record(&message.content) {
            Some(record) => records.push((message.id, record)),
            None => {
                tracing::debug!("Skipping non-record message {}", message.id);
                skipped += 1;
            }
        }
    }
    (records, skipped)
}

/// Split one store's records into the newest write set and everything
/// else. Only records carrying the highest timestamp survive, one per part;
/// the message id breaks ties within a part.
fn select_newest_write(candidates: Vec<Candidate>) -> (Vec<Candidate>, Vec<Candidate>) {
    let Some(newest_t) = candidates.iter().map(|c| c.record.timestamp).max() else {
        return (Vec::new(), Vec::new());
    };

    let mut by_part: BTreeMap<u32, Candidate> = BTreeMap::new();
    let mut stale = Vec::new();
    for candidate in candidates {
        if candidate.record.timestamp != newest_t {
            stale.push(candidate);
            continue;
        }
        match by_part.remove(&candidate.record.part) {
            Some(kept) if kept.message_id > candidate.message_id => {
                stale.push(candidate);
                by_part.insert(kept.record.part, kept);
            }
            Some(kept) => {
                stale.push(kept);
                by_part.insert(candidate.record.part, candidate);
            }
            None => {
                by_part.insert(candidate.record.part, candidate);
            }
        }
    }
    (by_part.into_values().collect(), stale)
}

/// Scan the channel and rebuild every store found in it.
pub async fn reconstruct(
    backend: &dyn MessageBackend,
    channel_id: u64,
    options: &ScanOptions,
) -> Result<Reconstruction> {
    let messages = backend
        .fetch_recent_messages(channel_id, options.history_limit)
        .await?;
    let (records, skipped) = collect_records(messages, backend.self_id());

    // store -> candidates
    let mut grouped: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for (message_id, record) in records {
        grouped
            .entry(record.store.clone())
            .or_default()
            .push(Candidate { message_id, record });
    }

    let mut reconstruction = Reconstruction {
        skipped,
        ..Default::default()
    };
    let mut first_delete = true;

    for (store_name, candidates) in grouped {
        let (mut survivors, stale) = select_newest_write(candidates);

        for stale in stale {
            if !first_delete && !options.write_delay.is_zero() {
                tokio::time::sleep(options.write_delay).await;
            }
            first_delete = false;
            match backend.delete_message(channel_id, stale.message_id).await {
                Ok(()) => {
                    reconstruction.duplicates_removed += 1;
                    tracing::debug!(
                        "Auto-healing: deleted stale record {} (t={}) for store \"{}\" part {}",
                        stale.message_id,
                        stale.record.timestamp,
                        store_name,
                        stale.record.part
                    );
                }
                Err(e) => tracing::warn!(
                    "Failed to delete duplicate message {}: {}",
                    stale.message_id,
                    e
                ),
            }
        }

        survivors.sort_by_key(|c| c.record.part);
        let expected = survivors
            .iter()
            .map(|c| c.record.total_parts)
            .max()
            .unwrap_or(1);
        if survivors.len() as u32 != expected {
            tracing::warn!(
                "Store \"{}\" loaded from {}/{} parts",
                store_name,
                survivors.len(),
                expected
            );
        }

        let backing_message_ids = survivors.iter().map(|c| c.message_id).collect();
        let data = codec::decode(survivors.into_iter().map(|c| c.record).collect());
        tracing::info!(
            "Loaded store \"{}\" from {} message(s)",
            store_name,
            expected
        );
        reconstruction.stores.insert(
            store_name,
            LoadedStore {
                data,
                backing_message_ids,
            },
        );
    }

    if reconstruction.duplicates_removed > 0 {
        tracing::info!(
            "Auto-healing: removed {} duplicate message(s) from keystore",
            reconstruction.duplicates_removed
        );
    }

    Ok(reconstruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryChannel;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const CHANNEL: u64 = 10;
    const BOT: u64 = 1;

    fn options() -> ScanOptions {
        ScanOptions {
            history_limit: 100,
            write_delay: Duration::ZERO,
        }
    }

    async fn post(channel: &MemoryChannel, record: ChunkRecord) -> u64 {
        channel
            .send_message(CHANNEL, &record.to_content().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reconstructs_single_and_multi_part_stores() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        post(&channel, ChunkRecord::new("a", 10, 1, 1, json!({"k": 1}))).await;
        post(&channel, ChunkRecord::new("b", 10, 1, 2, json!({"x": 1}))).await;
        post(&channel, ChunkRecord::new("b", 10, 2, 2, json!({"y": 2}))).await;

        let result = reconstruct(&channel, CHANNEL, &options()).await.unwrap();
        assert_eq!(result.stores["a"].data, json!({"k": 1}));
        assert_eq!(result.stores["b"].data, json!({"x": 1, "y": 2}));
        assert_eq!(result.stores["b"].backing_message_ids.len(), 2);
        assert_eq!(result.duplicates_removed, 0);
    }

    #[tokio::test]
    async fn test_ignores_foreign_and_garbage_messages() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        post(&channel, ChunkRecord::new("a", 10, 1, 1, json!({"k": 1}))).await;
        channel.inject(
            99,
            &ChunkRecord::new("a", 50, 1, 1, json!({"k": "forged"}))
                .to_content()
                .unwrap(),
        );
        channel.send_message(CHANNEL, "just chatting").await.unwrap();

        let result = reconstruct(&channel, CHANNEL, &options()).await.unwrap();
        assert_eq!(result.stores["a"].data, json!({"k": 1}));
        assert_eq!(result.skipped, 1);
        assert_eq!(channel.delete_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_writers_converge_on_newest() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        post(&channel, ChunkRecord::new("x", 100, 1, 1, json!({"a": 1}))).await;
        post(&channel, ChunkRecord::new("x", 200, 1, 1, json!({"a": 2}))).await;

        let result = reconstruct(&channel, CHANNEL, &options()).await.unwrap();
        assert_eq!(result.stores["x"].data, json!({"a": 2}));
        assert_eq!(result.duplicates_removed, 1);

        let remaining = channel.records();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, 200);
    }

    #[tokio::test]
    async fn test_older_write_parts_never_leak_into_newer_write() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        // the store shrank from two parts to one between writes
        post(&channel, ChunkRecord::new("x", 100, 1, 2, json!({"a": 1}))).await;
        post(&channel, ChunkRecord::new("x", 100, 2, 2, json!({"b": 1}))).await;
        post(&channel, ChunkRecord::new("x", 200, 1, 1, json!({"a": 2}))).await;

        let result = reconstruct(&channel, CHANNEL, &options()).await.unwrap();
        assert_eq!(result.stores["x"].data, json!({"a": 2}));
        assert_eq!(result.stores["x"].backing_message_ids.len(), 1);
        assert_eq!(result.duplicates_removed, 2);

        let remaining = channel.records();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().all(|r| r.timestamp == 200));
    }

    #[tokio::test]
    async fn test_reconstruction_is_idempotent() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        post(&channel, ChunkRecord::new("x", 100, 1, 2, json!({"a": 1}))).await;
        post(&channel, ChunkRecord::new("x", 100, 2, 2, json!({"b": 1}))).await;
        post(&channel, ChunkRecord::new("x", 300, 1, 2, json!({"a": 3}))).await;
        post(&channel, ChunkRecord::new("x", 300, 2, 2, json!({"b": 3}))).await;

        let first = reconstruct(&channel, CHANNEL, &options()).await.unwrap();
        assert_eq!(first.duplicates_removed, 2);
        let deletes_after_first = channel.delete_count();

        let second = reconstruct(&channel, CHANNEL, &options()).await.unwrap();
        assert_eq!(second.duplicates_removed, 0);
        assert_eq!(channel.delete_count(), deletes_after_first);
        assert_eq!(first.stores, second.stores);
        assert_eq!(second.stores["x"].data, json!({"a": 3, "b": 3}));
    }

    #[tokio::test]
    async fn test_failed_deletes_do_not_block_loading() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        post(&channel, ChunkRecord::new("x", 1, 1, 1, json!({"v": "old"}))).await;
        post(&channel, ChunkRecord::new("x", 2, 1, 1, json!({"v": "new"}))).await;
        channel.fail_deletes(true);

        let result = reconstruct(&channel, CHANNEL, &options()).await.unwrap();
        assert_eq!(result.stores["x"].data, json!({"v": "new"}));
        assert_eq!(result.duplicates_removed, 0);
    }
}
