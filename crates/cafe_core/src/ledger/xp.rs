//! XP ledger (store `user-levels`).
//!
//! One entry per guild member, keyed `"{guild}-{user}"`, stored compactly as
//! `[xp, lastMessageMs, messageCount]`. Older data may hold the object form
//! `{xp, lastMessageTime|lmt, messageCount|mc}`; it is read transparently and
//! rewritten compactly on the next write.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value as JsonValue};

use crate::keystore::{Clock, Keystore};
use crate::ledger::{parse_id, take_object, LedgerCore};
use crate::ranks::{rank_by_xp, Rank};

pub const STORE: &str = "user-levels";

pub const MIN_MESSAGE_XP: u64 = 5;
pub const MAX_MESSAGE_XP: u64 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserXp {
    pub xp: u64,
    pub last_message_ms: i64,
    pub message_count: u64,
}

impl UserXp {
    fn to_json(self) -> JsonValue {
        json!([self.xp, self.last_message_ms, self.message_count])
    }

    /// Either storage form; anything unreadable counts as zero.
    fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Array(items) => Self {
                xp: items.first().and_then(as_u64_lenient).unwrap_or(0),
                last_message_ms: items.get(1).and_then(JsonValue::as_i64).unwrap_or(0),
                message_count: items.get(2).and_then(as_u64_lenient).unwrap_or(0),
            },
            JsonValue::Object(obj) => Self {
                xp: obj.get("xp").and_then(as_u64_lenient).unwrap_or(0),
                last_message_ms: obj
                    .get("lastMessageTime")
                    .or_else(|| obj.get("lmt"))
                    .and_then(JsonValue::as_i64)
                    .unwrap_or(0),
                message_count: obj
                    .get("messageCount")
                    .or_else(|| obj.get("mc"))
                    .and_then(as_u64_lenient)
                    .unwrap_or(0),
            },
            _ => Self::default(),
        }
    }
}

impl UserXp {
    fn record_message(self, amount: u64, now_ms: i64) -> Self {
        Self {
            xp: self.xp.saturating_add(amount),
            last_message_ms: now_ms,
            message_count: self.message_count + 1,
        }
    }
}

/// XP written by older versions could be fractional after multipliers.
fn as_u64_lenient(value: &JsonValue) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

/// Result of [`XpLedger::add_user_xp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XpGain {
    pub leveled_up: bool,
    pub old_rank: &'static Rank,
    pub new_rank: &'static Rank,
    pub total_xp: u64,
    pub xp_gained: u64,
}

impl XpGain {
    fn between(old: UserXp, new: UserXp, xp_gained: u64) -> Self {
        let old_rank = rank_by_xp(old.xp);
        let new_rank = rank_by_xp(new.xp);
        Self {
            leveled_up: new_rank.level > old_rank.level,
            old_rank,
            new_rank,
            total_xp: new.xp,
            xp_gained,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub user_id: u64,
    pub xp: u64,
    pub message_count: u64,
    pub rank: &'static Rank,
}

fn user_key(guild_id: u64, user_id: u64) -> String {
    format!("{guild_id}-{user_id}")
}

#[derive(Debug, Clone)]
pub struct XpLedger {
    core: LedgerCore,
}

impl XpLedger {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self {
            core: LedgerCore::new(keystore, STORE),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.core.clock = clock;
        self
    }

    pub fn get_user_xp(&self, guild_id: u64, user_id: u64) -> UserXp {
        self.core
            .keystore
            .get_store(STORE)
            .get(user_key(guild_id, user_id))
            .map(UserXp::from_json)
            .unwrap_or_default()
    }

    /// Add XP for one message and report whether the user ranked up.
    pub async fn add_user_xp(&self, guild_id: u64, user_id: u64, amount: u64) -> XpGain {
        let key = user_key(guild_id, user_id);
        let now = self.core.now();
        let (old, new) = self
            .core
            .keystore
            .update_store(STORE, |data| {
                let mut table = take_object(STORE, data);
                let old = table.get(&key).map(UserXp::from_json).unwrap_or_default();
                let new = old.record_message(amount, now);
                table.insert(key.clone(), new.to_json());
                *data = JsonValue::Object(table);
                (old, new)
            })
            .await;
        XpGain::between(old, new, amount)
    }

    /// Like [`add_user_xp`](Self::add_user_xp), but only when the cooldown
    /// since the user's last awarded message has elapsed. The check and the
    /// write happen under the same store lock, so concurrent messages from
    /// one user award XP at most once per cooldown.
    pub async fn award_message_xp(
        &self,
        guild_id: u64,
        user_id: u64,
        amount: u64,
        cooldown: Duration,
    ) -> Option<XpGain> {
        let key = user_key(guild_id, user_id);
        let now = self.core.now();
        let (old, new) = self
            .core
            .keystore
            .update_store(STORE, |data| {
                let mut table = take_object(STORE, data);
                let old = table.get(&key).map(UserXp::from_json).unwrap_or_default();
                let awarded = can_gain_xp(old.last_message_ms, now, cooldown).then(|| {
                    let new = old.record_message(amount, now);
                    table.insert(key.clone(), new.to_json());
                    (old, new)
                });
                *data = JsonValue::Object(table);
                awarded
            })
            .await?;
        Some(XpGain::between(old, new, amount))
    }

    /// Overwrite a user's XP (clamped at 0), keeping timestamp and count.
    pub async fn set_user_xp(&self, guild_id: u64, user_id: u64, xp: i64) -> UserXp {
        let key = user_key(guild_id, user_id);
        self.core
            .keystore
            .update_store(STORE, |data| {
                let mut table = take_object(STORE, data);
                let current = table.get(&key).map(UserXp::from_json).unwrap_or_default();
                let updated = UserXp {
                    xp: xp.max(0) as u64,
                    ..current
                };
                table.insert(key.clone(), updated.to_json());
                *data = JsonValue::Object(table);
                updated
            })
            .await
    }

    /// Top `limit` members of a guild by XP.
    pub fn leaderboard(&self, guild_id: u64, limit: usize) -> Vec<LeaderboardEntry> {
        let data = self.core.keystore.get_store(STORE);
        let Some(table) = data.as_object() else {
            return Vec::new();
        };
        let prefix = format!("{guild_id}-");
        let mut entries: Vec<LeaderboardEntry> = table
            .iter()
            .filter_map(|(key, value)| {
                let user_id = parse_id(key.strip_prefix(&prefix)?)?;
                let stats = UserXp::from_json(value);
                Some(LeaderboardEntry {
                    user_id,
                    xp: stats.xp,
                    message_count: stats.message_count,
                    rank: rank_by_xp(stats.xp),
                })
            })
            .collect();
        entries.sort_by(|a, b| b.xp.cmp(&a.xp).then(a.user_id.cmp(&b.user_id)));
        entries.truncate(limit);
        entries
    }

    /// Whether the user's XP cooldown has elapsed.
    pub fn can_gain_xp(&self, last_message_ms: i64, cooldown: Duration) -> bool {
        can_gain_xp(last_message_ms, self.core.now(), cooldown)
    }
}

pub fn can_gain_xp(last_message_ms: i64, now_ms: i64, cooldown: Duration) -> bool {
    now_ms.saturating_sub(last_message_ms) >= cooldown.as_millis() as i64
}

/// Random XP for one message, 5 to 15 inclusive.
pub fn random_message_xp() -> u64 {
    random_xp_between(MIN_MESSAGE_XP, MAX_MESSAGE_XP)
}

pub fn random_xp_between(min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    rand::rng().random_range(min..=max)
}

/// Apply a referral multiplier, rounding down like the stored totals.
pub fn apply_multiplier(base: u64, multiplier: f64) -> u64 {
    (base as f64 * multiplier).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{keystore, TestClock};
    use pretty_assertions::assert_eq;

    const GUILD: u64 = 1;

    #[tokio::test]
    async fn test_add_xp_writes_compact_form() {
        let ks = keystore();
        let clock = TestClock::at(1_700_000_000_000);
        let ledger = XpLedger::new(Arc::clone(&ks)).with_clock(clock.clock());

        let gain = ledger.add_user_xp(GUILD, 42, 12).await;
        assert_eq!(gain.total_xp, 12);
        assert!(!gain.leveled_up);
        assert_eq!(
            ks.get_store(STORE),
            json!({"1-42": [12, 1_700_000_000_000_i64, 1]})
        );
    }

    #[tokio::test]
    async fn test_rank_up_detection() {
        let ks = keystore();
        ks.set_store(STORE, json!({"1-42": [95, 0, 10]}));
        let ledger = XpLedger::new(ks);

        let gain = ledger.add_user_xp(GUILD, 42, 10).await;
        assert!(gain.leveled_up);
        assert_eq!(gain.old_rank.level, 1);
        assert_eq!(gain.new_rank.level, 2);
        assert_eq!(ledger.get_user_xp(GUILD, 42).message_count, 11);
    }

    #[tokio::test]
    async fn test_reads_legacy_object_form() {
        let ks = keystore();
        ks.set_store(
            STORE,
            json!({
                "1-7": {"xp": 300, "lastMessageTime": 55, "messageCount": 4},
                "1-8": {"xp": 20, "lmt": 66, "mc": 2},
            }),
        );
        let ledger = XpLedger::new(Arc::clone(&ks));
        assert_eq!(
            ledger.get_user_xp(GUILD, 7),
            UserXp {
                xp: 300,
                last_message_ms: 55,
                message_count: 4
            }
        );
        assert_eq!(ledger.get_user_xp(GUILD, 8).last_message_ms, 66);

        ledger.add_user_xp(GUILD, 8, 5).await;
        assert!(ks.get_store(STORE)["1-8"].is_array());
    }

    #[tokio::test]
    async fn test_set_xp_clamps_and_keeps_metadata() {
        let ks = keystore();
        ks.set_store(STORE, json!({"1-3": [500, 99, 12]}));
        let ledger = XpLedger::new(ks);

        let updated = ledger.set_user_xp(GUILD, 3, -40).await;
        assert_eq!(
            updated,
            UserXp {
                xp: 0,
                last_message_ms: 99,
                message_count: 12
            }
        );
    }

    #[tokio::test]
    async fn test_leaderboard_is_per_guild_and_sorted() {
        let ks = keystore();
        ks.set_store(
            STORE,
            json!({
                "1-10": [50, 0, 1],
                "1-11": [700, 0, 9],
                "1-12": {"xp": 300},
                "2-13": [9999, 0, 1],
                "garbage": [1, 2, 3],
            }),
        );
        let ledger = XpLedger::new(ks);

        let board = ledger.leaderboard(GUILD, 2);
        let ids: Vec<u64> = board.iter().map(|e| e.user_id).collect();
        assert_eq!(ids, vec![11, 12]);
        assert_eq!(board[0].rank.level, 4);
    }

    #[tokio::test]
    async fn test_award_respects_cooldown_atomically() {
        let ks = keystore();
        let clock = TestClock::at(1_000_000);
        let ledger = XpLedger::new(Arc::clone(&ks)).with_clock(clock.clock());
        let cooldown = Duration::from_secs(60);

        let (first, second) = tokio::join!(
            ledger.award_message_xp(GUILD, 9, 10, cooldown),
            ledger.award_message_xp(GUILD, 9, 10, cooldown),
        );
        assert_eq!(first.is_some() as u8 + second.is_some() as u8, 1);
        assert_eq!(ledger.get_user_xp(GUILD, 9).xp, 10);
        assert_eq!(ledger.get_user_xp(GUILD, 9).message_count, 1);

        clock.advance(60_000);
        let gain = ledger.award_message_xp(GUILD, 9, 5, cooldown).await;
        assert_eq!(gain.map(|g| g.total_xp), Some(15));
    }

    #[test]
    fn test_cooldown() {
        let cooldown = Duration::from_secs(60);
        assert!(can_gain_xp(0, 60_000, cooldown));
        assert!(!can_gain_xp(10_000, 60_000, cooldown));
    }

    #[test]
    fn test_random_xp_range() {
        for _ in 0..200 {
            let xp = random_message_xp();
            assert!((MIN_MESSAGE_XP..=MAX_MESSAGE_XP).contains(&xp));
        }
        assert_eq!(random_xp_between(7, 7), 7);
    }

    #[test]
    fn test_apply_multiplier() {
        assert_eq!(apply_multiplier(15, 1.0), 15);
        assert_eq!(apply_multiplier(15, 1.25), 18);
        assert_eq!(apply_multiplier(15, 1.5), 22);
    }
}
