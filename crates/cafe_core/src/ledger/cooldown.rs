//! AI cooldown ledger (store `ai-cooldowns`).
//!
//! A flat object mixing four kinds of keys:
//!
//! - `"{user}"`: timestamps of recent AI requests (a bare number in old data)
//! - `"warned_{user}"`: when the user was last told they hit the rate limit
//! - `"bot_cooldown_{user}"`: expiry of a moderation cooldown
//! - `"msg_{message}"`: when an instance claimed a message for answering
//!
//! Every read prunes entries that fell out of their window and writes the
//! pruned table back if anything was removed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value as JsonValue};

use crate::keystore::{Clock, Keystore};
use crate::ledger::{take_object, LedgerCore};

pub const STORE: &str = "ai-cooldowns";

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const MAX_REQUESTS_PER_WINDOW: u32 = 5;
/// Multipliers at or above this disable the rate limit.
pub const UNLIMITED_MULTIPLIER: u32 = 999;

const CLAIM_WINDOW: Duration = Duration::from_secs(30);
const CLAIM_RETENTION: Duration = Duration::from_secs(5 * 60);
const CLAIM_SETTLE: Duration = Duration::from_millis(200);

const WARNED_PREFIX: &str = "warned_";
const BOT_COOLDOWN_PREFIX: &str = "bot_cooldown_";
const CLAIM_PREFIX: &str = "msg_";

fn ms(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

/// Answer of [`CooldownLedger::check_rate_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub requests_remaining: u32,
    /// When refused, how long until the oldest request leaves the window.
    pub retry_after: Option<Duration>,
}

impl RateLimitStatus {
    /// `"{m}m {s}s"`, rounded up to the second.
    pub fn retry_after_label(&self) -> Option<String> {
        self.retry_after.map(|wait| {
            let secs = wait.as_millis().div_ceil(1000) as u64;
            format!("{}m {}s", secs / 60, secs % 60)
        })
    }
}

/// Drop expired entries. Returns how many keys were removed or rewritten.
fn prune(table: &mut Map<String, JsonValue>, now: i64) -> usize {
    let window = ms(RATE_LIMIT_WINDOW);
    let before = table.len();
    let mut rewritten = 0;

    table.retain(|key, value| {
        if key.starts_with(CLAIM_PREFIX) {
            return value
                .as_i64()
                .is_some_and(|at| now - at < ms(CLAIM_RETENTION));
        }
        if key.starts_with(WARNED_PREFIX) {
            return value.as_i64().is_some_and(|at| now - at < window);
        }
        if key.starts_with(BOT_COOLDOWN_PREFIX) {
            return value.as_i64().is_some_and(|until| now < until);
        }
        match value {
            JsonValue::Array(stamps) => {
                let len = stamps.len();
                stamps.retain(|stamp| stamp.as_i64().is_some_and(|at| now - at < window));
                if stamps.len() != len {
                    rewritten += 1;
                }
                !stamps.is_empty()
            }
            JsonValue::Number(n) => n.as_i64().is_some_and(|at| now - at < window),
            _ => false,
        }
    });

    let removed = before - table.len() + rewritten;
    if removed > 0 {
        tracing::debug!("Cleaned {} old entries from {}", removed, STORE);
    }
    removed
}

/// Request timestamps of a user, accepting the legacy single number.
fn request_stamps(table: &Map<String, JsonValue>, user_id: u64) -> Vec<i64> {
    match table.get(&user_id.to_string()) {
        Some(JsonValue::Array(stamps)) => stamps.iter().filter_map(JsonValue::as_i64).collect(),
        Some(value) => value.as_i64().into_iter().collect(),
        None => Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct CooldownLedger {
    core: LedgerCore,
    claim_settle: Duration,
}

impl CooldownLedger {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self {
            core: LedgerCore::new(keystore, STORE),
            claim_settle: CLAIM_SETTLE,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.core.clock = clock;
        self
    }

    /// Read-modify-write with pruning applied first.
    async fn update<R>(&self, f: impl FnOnce(&mut Map<String, JsonValue>, i64) -> R) -> R {
        let now = self.core.now();
        self.core
            .keystore
            .update_store(STORE, |data| {
                let mut table = take_object(STORE, data);
                prune(&mut table, now);
                let result = f(&mut table, now);
                *data = JsonValue::Object(table);
                result
            })
            .await
    }

    /// Pruned view of the table. Writes back only when something expired.
    pub async fn load(&self) -> Map<String, JsonValue> {
        self.update(|table, _| table.clone()).await
    }

    pub async fn check_rate_limit(&self, user_id: u64, multiplier: u32) -> RateLimitStatus {
        let table = self.load().await;
        let now = self.core.now();
        let stamps = request_stamps(&table, user_id);

        let limit = if multiplier >= UNLIMITED_MULTIPLIER {
            u32::MAX
        } else {
            MAX_REQUESTS_PER_WINDOW.saturating_mul(multiplier.max(1))
        };
        let used = stamps.len() as u32;
        if used < limit {
            return RateLimitStatus {
                allowed: true,
                requests_remaining: limit - used,
                retry_after: None,
            };
        }

        let oldest = stamps.iter().copied().min().unwrap_or(now);
        let wait = (ms(RATE_LIMIT_WINDOW) - (now - oldest)).max(0);
        RateLimitStatus {
            allowed: false,
            requests_remaining: 0,
            retry_after: Some(Duration::from_millis(wait as u64)),
        }
    }

    /// Count one AI request against the user's window.
    pub async fn record_request(&self, user_id: u64) {
        self.update(|table, now| {
            let mut stamps = request_stamps(table, user_id);
            stamps.push(now);
            table.insert(user_id.to_string(), json!(stamps));
        })
        .await;
    }

    /// Give back the most recent request, e.g. when answering failed.
    pub async fn undo_last_request(&self, user_id: u64) {
        self.update(|table, _| {
            let mut stamps = request_stamps(table, user_id);
            if stamps.pop().is_none() {
                return;
            }
            if stamps.is_empty() {
                table.remove(&user_id.to_string());
            } else {
                table.insert(user_id.to_string(), json!(stamps));
            }
        })
        .await;
    }

    pub async fn is_warned(&self, user_id: u64) -> bool {
        self.load()
            .await
            .contains_key(&format!("{WARNED_PREFIX}{user_id}"))
    }

    pub async fn set_warned(&self, user_id: u64) {
        self.update(|table, now| {
            table.insert(format!("{WARNED_PREFIX}{user_id}"), json!(now));
        })
        .await;
    }

    /// Make the bot ignore a user for `minutes`.
    pub async fn set_bot_cooldown(&self, user_id: u64, minutes: u64) {
        self.update(|table, now| {
            let until = now + ms(Duration::from_secs(minutes * 60));
            table.insert(format!("{BOT_COOLDOWN_PREFIX}{user_id}"), json!(until));
        })
        .await;
    }

    /// Time left on the user's moderation cooldown, if any.
    pub async fn bot_cooldown_remaining(&self, user_id: u64) -> Option<Duration> {
        let table = self.load().await;
        let until = table
            .get(&format!("{BOT_COOLDOWN_PREFIX}{user_id}"))?
            .as_i64()?;
        let left = until - self.core.now();
        (left > 0).then(|| Duration::from_millis(left as u64))
    }

    /// Lift a moderation cooldown. Returns the time that was left, or `None`
    /// if the user had none.
    pub async fn remove_bot_cooldown(&self, user_id: u64) -> Option<Duration> {
        let removed = self
            .update(|table, now| {
                let until = table
                    .remove(&format!("{BOT_COOLDOWN_PREFIX}{user_id}"))?
                    .as_i64()?;
                Some(Duration::from_millis((until - now).max(0) as u64))
            })
            .await;
        if let Some(left) = removed {
            tracing::info!(
                "Bot cooldown removed for user {} ({}s remaining)",
                user_id,
                left.as_secs()
            );
        }
        removed
    }

    /// Best-effort claim of a message so only one instance answers it.
    ///
    /// A claim younger than 30 s wins over ours. Otherwise we write our
    /// claim, wait briefly, and keep it only if the stored claim is still
    /// ours. Across processes this is a heuristic: both instances can see
    /// their own claim if neither synced in between, and a slow sync can
    /// make both back off.
    pub async fn claim_message(&self, message_id: u64) -> bool {
        let key = format!("{CLAIM_PREFIX}{message_id}");
        let ours = self
            .update(|table, now| {
                let existing = table.get(&key).and_then(JsonValue::as_i64);
                if existing.is_some_and(|at| now - at < ms(CLAIM_WINDOW)) {
                    return None;
                }
                table.insert(key.clone(), json!(now));
                Some(now)
            })
            .await;
        let Some(ours) = ours else {
            tracing::info!("Message {} already claimed", message_id);
            return false;
        };

        tokio::time::sleep(self.claim_settle).await;

        let current = self.load().await.get(&key).and_then(JsonValue::as_i64);
        if current != Some(ours) {
            tracing::info!("Message {} claimed by another instance", message_id);
            return false;
        }
        true
    }
}
