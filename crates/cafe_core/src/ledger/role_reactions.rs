//! Reaction-role mappings (store `role-reactions`).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::keystore::{Clock, Keystore};
use crate::ledger::{parse_id, LedgerCore, RoleDirectory};

pub const STORE: &str = "role-reactions";

/// Reacting with `emoji` on `message_id` grants `role_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleReaction {
    pub guild_id: String,
    pub channel_id: String,
    pub message_id: String,
    /// Normalized with [`normalize_emoji`].
    pub emoji: String,
    pub role_id: String,
    /// RFC 3339.
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RoleReactionTable {
    #[serde(default)]
    reactions: Vec<RoleReaction>,
}

/// Strip variation selectors (U+FE00..=U+FE0F) so "❤️" and "❤" match.
pub fn normalize_emoji(emoji: &str) -> String {
    emoji
        .chars()
        .filter(|c| !('\u{FE00}'..='\u{FE0F}').contains(c))
        .collect()
}

#[derive(Debug, Clone)]
pub struct RoleReactionLedger {
    core: LedgerCore,
}

impl RoleReactionLedger {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self {
            core: LedgerCore::new(keystore, STORE),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.core.clock = clock;
        self
    }

    pub async fn add(
        &self,
        guild_id: u64,
        channel_id: u64,
        message_id: u64,
        emoji: &str,
        role_id: u64,
    ) -> RoleReaction {
        let created_at = chrono::DateTime::from_timestamp_millis(self.core.now())
            .unwrap_or_default()
            .to_rfc3339();
        let reaction = RoleReaction {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            emoji: normalize_emoji(emoji),
            role_id: role_id.to_string(),
            created_at,
        };

        let _guard = self.core.keystore.lock_store(STORE).await;
        let mut table: RoleReactionTable = self.core.load();
        table.reactions.push(reaction.clone());
        self.core.save(&table);
        tracing::info!(
            "Added role reaction: {} -> {} on message {}",
            emoji,
            role_id,
            message_id
        );
        reaction
    }

    /// The role granted by reacting with `emoji` on `message_id`.
    pub fn role_for_reaction(&self, message_id: u64, emoji: &str) -> Option<u64> {
        let emoji = normalize_emoji(emoji);
        let message_id = message_id.to_string();
        let table: RoleReactionTable = self.core.load();
        table
            .reactions
            .iter()
            .find(|r| r.message_id == message_id && r.emoji == emoji)
            .and_then(|r| parse_id(&r.role_id))
    }

    /// Remove the mapping(s) for `emoji` on `message_id`. Returns how many
    /// were removed.
    pub async fn remove(&self, message_id: u64, emoji: &str) -> usize {
        let emoji = normalize_emoji(emoji);
        let message_id = message_id.to_string();

        let _guard = self.core.keystore.lock_store(STORE).await;
        let mut table: RoleReactionTable = self.core.load();
        let before = table.reactions.len();
        table
            .reactions
            .retain(|r| !(r.message_id == message_id && r.emoji == emoji));
        let removed = before - table.reactions.len();
        if removed > 0 {
            self.core.save(&table);
        }
        removed
    }

    pub fn for_guild(&self, guild_id: u64) -> Vec<RoleReaction> {
        let guild_id = guild_id.to_string();
        let table: RoleReactionTable = self.core.load();
        table
            .reactions
            .into_iter()
            .filter(|r| r.guild_id == guild_id)
            .collect()
    }

    /// Drop mappings whose role was deleted. Lookups that fail keep the
    /// mapping. Returns how many were dropped.
    pub async fn cleanup(&self, roles: &dyn RoleDirectory) -> usize {
        let _guard = self.core.keystore.lock_store(STORE).await;
        let table: RoleReactionTable = self.core.load();
        let before = table.reactions.len();

        let mut kept = Vec::with_capacity(before);
        for reaction in table.reactions {
            let (Some(guild_id), Some(role_id)) =
                (parse_id(&reaction.guild_id), parse_id(&reaction.role_id))
            else {
                tracing::info!("Removing malformed role reaction on {}", reaction.message_id);
                continue;
            };
            match roles.role_exists(guild_id, role_id).await {
                Ok(true) => kept.push(reaction),
                Ok(false) => {
                    tracing::info!("Removing role reaction for deleted role {}", role_id)
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to validate reaction on message {}: {}",
                        reaction.message_id,
                        e
                    );
                    kept.push(reaction);
                }
            }
        }

        let removed = before - kept.len();
        if removed > 0 {
            self.core.save(&RoleReactionTable { reactions: kept });
            tracing::info!("Cleaned up {} invalid role reactions", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{keystore, FakeGuild};
    use serde_json::json;

    #[test]
    fn test_normalize_emoji() {
        assert_eq!(normalize_emoji("❤\u{FE0F}"), "❤");
        assert_eq!(normalize_emoji("☕"), "☕");
        assert_eq!(normalize_emoji("\u{FE00}a\u{FE0F}b"), "ab");
    }

    #[tokio::test]
    async fn test_add_lookup_remove() {
        let ks = keystore();
        let ledger = RoleReactionLedger::new(Arc::clone(&ks));
        ledger.add(1, 2, 3, "❤\u{FE0F}", 44).await;
        ledger.add(1, 2, 3, "☕", 45).await;

        assert_eq!(ledger.role_for_reaction(3, "❤"), Some(44));
        assert_eq!(ledger.role_for_reaction(3, "☕"), Some(45));
        assert_eq!(ledger.role_for_reaction(9, "☕"), None);

        assert_eq!(ledger.remove(3, "❤\u{FE0F}").await, 1);
        assert_eq!(ledger.role_for_reaction(3, "❤"), None);
        assert_eq!(ledger.remove(3, "❤").await, 0);

        let stored = ks.get_store(STORE);
        assert_eq!(stored["reactions"][0]["roleId"], json!("45"));
        assert_eq!(stored["reactions"][0]["messageId"], json!("3"));
    }

    #[tokio::test]
    async fn test_for_guild() {
        let ledger = RoleReactionLedger::new(keystore());
        ledger.add(1, 2, 3, "a", 10).await;
        ledger.add(7, 2, 3, "b", 11).await;
        let guild = ledger.for_guild(7);
        assert_eq!(guild.len(), 1);
        assert_eq!(guild[0].role_id, "11");
    }

    #[tokio::test]
    async fn test_cleanup_drops_deleted_roles() {
        let ledger = RoleReactionLedger::new(keystore());
        ledger.add(1, 2, 3, "a", 10).await;
        ledger.add(1, 2, 3, "b", 11).await;

        let mut guild = FakeGuild::default();
        guild.roles.insert(10);
        assert_eq!(ledger.cleanup(&guild).await, 1);
        assert_eq!(ledger.for_guild(1).len(), 1);

        // lookups that error keep everything
        guild.broken = true;
        assert_eq!(ledger.cleanup(&guild).await, 0);
        assert_eq!(ledger.for_guild(1).len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_store_reads_as_empty() {
        let ks = keystore();
        ks.set_store(STORE, json!({"reactions": "oops"}));
        let ledger = RoleReactionLedger::new(ks);
        assert!(ledger.for_guild(1).is_empty());
        assert_eq!(ledger.role_for_reaction(1, "a"), None);
    }
}
