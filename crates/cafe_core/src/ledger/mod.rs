//! Ledgers - typed views over individual keystore stores
//!
//! Each ledger owns one store and receives the shared [`Keystore`] at
//! construction. Mutations are read-modify-write under the store's lock.
//! Guild lookups the ledgers need (members, roles) go through the small
//! directory traits below so the ledgers stay transport-agnostic.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::error::BackendError;
use crate::keystore::{Clock, Keystore};

pub mod cooldown;
pub mod deletions;
pub mod referral;
pub mod role_reactions;
pub mod xp;

pub use cooldown::{CooldownLedger, RateLimitStatus};
pub use deletions::{DeletionLedger, DeletionRun, DeletionStats, ScheduledDeletion};
pub use referral::{ReferralLedger, ReferralPerks, ReferralStats, ValidatedReferral};
pub use role_reactions::{normalize_emoji, RoleReaction, RoleReactionLedger};
pub use xp::{LeaderboardEntry, UserXp, XpGain, XpLedger};

/// A guild member as the ledgers need to see one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: u64,
    pub display_name: String,
}

/// Member lookups.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// `Ok(None)` when the user is not (or no longer) in the guild.
    async fn member(&self, guild_id: u64, user_id: u64) -> Result<Option<MemberInfo>, BackendError>;
}

/// Role lookups.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn role_exists(&self, guild_id: u64, role_id: u64) -> Result<bool, BackendError>;
}

/// Wall clock in unix milliseconds.
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Shared state of every ledger.
#[derive(Clone)]
pub(crate) struct LedgerCore {
    pub(crate) keystore: Arc<Keystore>,
    pub(crate) clock: Clock,
    pub(crate) store: &'static str,
}

impl LedgerCore {
    pub(crate) fn new(keystore: Arc<Keystore>, store: &'static str) -> Self {
        Self {
            keystore,
            clock: system_clock(),
            store,
        }
    }

    pub(crate) fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Current store contents decoded as `T`, or `T::default()` if the
    /// stored shape does not match.
    pub(crate) fn load<T: DeserializeOwned + Default>(&self) -> T {
        decode_or_default(self.store, self.keystore.get_store(self.store))
    }

    pub(crate) fn save<T: serde::Serialize>(&self, value: &T) {
        if let Err(e) = self.keystore.set_typed(self.store, value) {
            tracing::error!("Failed to encode store \"{}\": {}", self.store, e);
        }
    }
}

impl std::fmt::Debug for LedgerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerCore")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

pub(crate) fn decode_or_default<T: DeserializeOwned + Default>(store: &str, value: JsonValue) -> T {
    match serde_json::from_value(value) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!("Store \"{}\" has an unexpected shape, treating as empty: {}", store, e);
            T::default()
        }
    }
}

/// Take a store's top-level object out of `data`, leaving `Null` behind.
/// Anything that is not an object is discarded with a warning.
pub(crate) fn take_object(store: &str, data: &mut JsonValue) -> Map<String, JsonValue> {
    match std::mem::take(data) {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            tracing::warn!("Store \"{}\" held {}, resetting to an object", store, kind(&other));
            Map::new()
        }
    }
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Discord snowflakes are stored as strings.
pub(crate) fn parse_id(raw: &str) -> Option<u64> {
    raw.parse().ok()
}
