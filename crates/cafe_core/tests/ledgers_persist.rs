//! Ledgers on a channel-backed keystore keep their state across restarts.

use std::sync::Arc;

use cafe_core::config::KeystoreConfig;
use cafe_core::keystore::Keystore;
use cafe_core::ledger::{CooldownLedger, DeletionLedger, RoleReactionLedger, XpLedger};
use cafe_core::test_utils::MemoryChannel;

const BOT: u64 = 900;
const CHANNEL: u64 = 1234;
const GUILD: u64 = 55;

async fn instance(channel: &MemoryChannel) -> Arc<Keystore> {
    let config = KeystoreConfig {
        channel_id: Some(CHANNEL),
        write_delay_ms: 0,
        ..Default::default()
    };
    let keystore = Arc::new(Keystore::new(Arc::new(channel.clone()), config));
    keystore.initialize().await.unwrap();
    keystore
}

#[tokio::test]
async fn test_ledgers_reload_from_channel() {
    let channel = MemoryChannel::new(BOT, CHANNEL);
    let first = instance(&channel).await;

    let xp = XpLedger::new(Arc::clone(&first));
    let gain = xp.add_user_xp(GUILD, 7, 120).await;
    assert!(gain.leveled_up);
    assert_eq!(gain.new_rank.level, 2);

    RoleReactionLedger::new(Arc::clone(&first))
        .add(GUILD, 2, 3, "☕", 99)
        .await;
    CooldownLedger::new(Arc::clone(&first))
        .set_bot_cooldown(7, 10)
        .await;
    DeletionLedger::new(Arc::clone(&first))
        .schedule(GUILD, 2, 500, std::time::Duration::from_secs(3600))
        .await;

    assert!(first.shutdown().await.is_clean());

    let second = instance(&channel).await;
    let xp = XpLedger::new(Arc::clone(&second));
    let user = xp.get_user_xp(GUILD, 7);
    assert_eq!(user.xp, 120);
    assert_eq!(user.message_count, 1);
    assert_eq!(xp.leaderboard(GUILD, 10).len(), 1);

    assert_eq!(
        RoleReactionLedger::new(Arc::clone(&second)).role_for_reaction(3, "☕"),
        Some(99)
    );
    assert!(CooldownLedger::new(Arc::clone(&second))
        .bot_cooldown_remaining(7)
        .await
        .is_some());
    assert_eq!(DeletionLedger::new(second).stats().total, 1);
}
