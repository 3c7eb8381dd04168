//! Invite use tracking, to tell which invite a new member joined through.

use std::collections::HashMap;

use parking_lot::Mutex;
use serenity::all::{GuildId, Http};

/// Last known use count of every invite, per guild.
#[derive(Debug, Default)]
pub struct InviteTracker {
    uses: Mutex<HashMap<GuildId, HashMap<String, u64>>>,
}

impl InviteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read a guild's invites. Returns the previous snapshot.
    pub async fn refresh(&self, http: &Http, guild_id: GuildId) -> Option<HashMap<String, u64>> {
        let invites = match guild_id.invites(http).await {
            Ok(invites) => invites,
            Err(e) => {
                tracing::error!("Failed to fetch invites for guild {}: {}", guild_id, e);
                return None;
            }
        };
        let snapshot: HashMap<String, u64> = invites
            .into_iter()
            .map(|invite| (invite.code, invite.uses))
            .collect();
        Some(self.replace(guild_id, snapshot))
    }

    fn replace(&self, guild_id: GuildId, snapshot: HashMap<String, u64>) -> HashMap<String, u64> {
        self.uses
            .lock()
            .insert(guild_id, snapshot)
            .unwrap_or_default()
    }

    /// The invite used by a member who just joined, if it can be told.
    pub async fn detect_used(&self, http: &Http, guild_id: GuildId) -> Option<String> {
        // Without a baseline every used invite would look fresh.
        let known = self.uses.lock().contains_key(&guild_id);
        let before = self.refresh(http, guild_id).await?;
        if !known {
            return None;
        }
        let after = self.uses.lock().get(&guild_id).cloned().unwrap_or_default();
        used_invite(&before, &after)
    }
}

/// The first invite whose use count went up between two snapshots.
pub fn used_invite(before: &HashMap<String, u64>, after: &HashMap<String, u64>) -> Option<String> {
    let mut codes: Vec<&String> = after.keys().collect();
    codes.sort();
    codes
        .into_iter()
        .find(|code| after[*code] > before.get(*code).copied().unwrap_or(0))
        .cloned()
}
