//! Integration tests for the keystore over a shared in-memory channel.
//!
//! Several `Keystore`s pointed at one `MemoryChannel` play the part of bot
//! instances sharing the same backing channel.

use std::sync::Arc;
use std::time::Duration;

use cafe_core::config::KeystoreConfig;
use cafe_core::keystore::{ChunkRecord, Keystore};
use cafe_core::test_utils::MemoryChannel;
use pretty_assertions::assert_eq;
use serde_json::json;

const BOT: u64 = 900;
const CHANNEL: u64 = 1234;

fn config() -> KeystoreConfig {
    KeystoreConfig {
        channel_id: Some(CHANNEL),
        write_delay_ms: 0,
        ..Default::default()
    }
}

async fn instance(channel: &MemoryChannel, now: i64) -> Arc<Keystore> {
    let keystore = Arc::new(Keystore::new(Arc::new(channel.clone()), config()).with_clock(move || now));
    keystore.initialize().await.unwrap();
    keystore
}

#[tokio::test]
async fn test_state_survives_restart() {
    let channel = MemoryChannel::new(BOT, CHANNEL);
    let first = instance(&channel, 1_000).await;
    first.set_store("user-levels", json!({"1": {"42": [120, 0, 9]}}));
    first.set_store("role-reactions", json!({"reactions": []}));
    let report = first.shutdown().await;
    assert!(report.is_clean());

    let second = instance(&channel, 2_000).await;
    assert_eq!(second.get_store("user-levels"), json!({"1": {"42": [120, 0, 9]}}));
    assert_eq!(second.get_store("role-reactions"), json!({"reactions": []}));
    assert_eq!(second.stats().dirty_stores, 0);
}

#[tokio::test]
async fn test_large_store_spans_records() {
    let channel = MemoryChannel::new(BOT, CHANNEL);
    let first = instance(&channel, 1_000).await;

    let mut users = serde_json::Map::new();
    for i in 0..300 {
        users.insert(format!("user{i:04}"), json!({"xp": i * 7, "note": "é".repeat(20)}));
    }
    let data = serde_json::Value::Object(users);
    first.set_store("big", data.clone());
    first.sync(false).await;

    let records = channel.records();
    assert!(records.len() > 1);
    let total = records.len() as u32;
    for record in &records {
        assert_eq!(record.total_parts, total);
        assert!(record.encoded_len().unwrap() <= 1900);
    }
    assert_eq!(first.backing_message_ids("big").len(), records.len());

    let second = instance(&channel, 2_000).await;
    assert_eq!(second.get_store("big"), data);

    // Shrinking the store replaces every old record
    second.set_store("big", json!({"small": true}));
    second.sync(false).await;
    assert_eq!(channel.records().len(), 1);
}

#[tokio::test]
async fn test_racing_instances_converge_on_newest_write() {
    let channel = MemoryChannel::new(BOT, CHANNEL);

    // Two instances flushed the same store without seeing each other
    let older = ChunkRecord::new("ai-cooldowns", 1_000, 1, 1, json!({"a": 1}));
    let newer = ChunkRecord::new("ai-cooldowns", 2_000, 1, 1, json!({"b": 2}));
    channel.inject(BOT, &newer.to_content().unwrap());
    channel.inject(BOT, &older.to_content().unwrap());
    // Someone else's look-alike is never trusted
    let foreign = ChunkRecord::new("ai-cooldowns", 9_000, 1, 1, json!({"evil": true}));
    channel.inject(77, &foreign.to_content().unwrap());

    let keystore = instance(&channel, 3_000).await;
    assert_eq!(keystore.get_store("ai-cooldowns"), json!({"b": 2}));

    // The losing record was cleaned up; the foreign one is left alone
    assert_eq!(channel.records(), vec![newer]);
    assert_eq!(channel.messages().len(), 2);

    // Loading again is stable
    let again = instance(&channel, 4_000).await;
    assert_eq!(again.get_store("ai-cooldowns"), json!({"b": 2}));
    assert_eq!(channel.messages().len(), 2);
}

#[tokio::test]
async fn test_sync_sees_records_written_by_peer() {
    let channel = MemoryChannel::new(BOT, CHANNEL);
    let a = instance(&channel, 1_000).await;
    let b = instance(&channel, 2_000).await;

    a.set_store("shared", json!({"from": "a"}));
    a.sync(false).await;
    b.set_store("shared", json!({"from": "b"}));
    b.sync(false).await;

    // b's live scan removed a's records before writing its own
    let records = channel.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, json!({"from": "b"}));

    let c = instance(&channel, 3_000).await;
    assert_eq!(c.get_store("shared"), json!({"from": "b"}));
}

#[tokio::test]
async fn test_only_dirty_stores_are_flushed() {
    let channel = MemoryChannel::new(BOT, CHANNEL);
    let first = instance(&channel, 1_000).await;
    first.set_store("one", json!({"x": 1}));
    first.set_store("two", json!({"y": 2}));
    first.sync(false).await;
    let sends = channel.send_count();

    let second = instance(&channel, 2_000).await;
    assert!(!second.is_dirty("one"));
    let report = second.sync(false).await;
    assert!(report.synced.is_empty());
    assert_eq!(channel.send_count(), sends);

    second.set_store("two", json!({"y": 3}));
    let report = second.sync(false).await;
    assert_eq!(report.synced, vec!["two".to_string()]);
    assert_eq!(channel.send_count(), sends + 1);

    // force rewrites everything
    let report = second.sync(true).await;
    assert_eq!(report.synced.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_flush() {
    let channel = MemoryChannel::new(BOT, CHANNEL);
    let keystore = instance(&channel, 1_000).await;
    keystore.set_store("timed", json!({"n": 1}));

    let period = keystore.config().sync_interval();
    tokio::time::sleep(period / 2).await;
    assert_eq!(channel.send_count(), 0);

    tokio::time::sleep(period / 2 + Duration::from_secs(1)).await;
    for _ in 0..10 {
        if !keystore.is_dirty("timed") {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!keystore.is_dirty("timed"));
    assert_eq!(channel.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sync_soon_debounces() {
    let channel = MemoryChannel::new(BOT, CHANNEL);
    let keystore = instance(&channel, 1_000).await;
    let debounce = keystore.config().flush_debounce();

    keystore.set_store("burst", json!({"n": 1}));
    keystore.sync_soon();
    tokio::time::sleep(debounce / 2).await;
    keystore.set_store("burst", json!({"n": 2}));
    keystore.sync_soon();
    tokio::time::sleep(debounce / 2).await;
    assert_eq!(channel.send_count(), 0);

    tokio::time::sleep(debounce).await;
    for _ in 0..10 {
        if channel.send_count() > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(channel.send_count(), 1);
    assert_eq!(channel.records()[0].data, json!({"n": 2}));
}

#[tokio::test]
async fn test_unusable_channel_falls_back_to_memory() {
    let channel = MemoryChannel::new(BOT, CHANNEL);
    channel.set_text_capable(false);
    let keystore = Arc::new(Keystore::new(Arc::new(channel.clone()), config()));
    let err = keystore.initialize().await.unwrap_err();
    assert!(err.to_string().contains("not a text channel"));

    let detached = Arc::new(Keystore::detached(config()));
    detached.initialize().await.unwrap();
    detached.set_store("s", json!({"v": 1}));
    assert_eq!(detached.sync(true).await.synced.len(), 0);
    assert_eq!(detached.get_store("s"), json!({"v": 1}));
    assert_eq!(channel.send_count(), 0);
}
