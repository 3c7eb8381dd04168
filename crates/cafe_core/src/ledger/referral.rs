//! Referral ledger (store `referral-system`).
//!
//! Invite codes map to the inviter. A member who joins through an invite is
//! recorded as a pending referral of the inviter and becomes validated once
//! they have stayed a week and reached the second rank.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keystore::{Clock, Keystore};
use crate::ledger::xp::XpLedger;
use crate::ledger::{parse_id, LedgerCore, MemberDirectory};
use crate::ranks::rank_by_xp;

pub const STORE: &str = "referral-system";

const VALIDATION_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const VALIDATION_MIN_LEVEL: u8 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReferrerRecord {
    pub invite_code: Option<String>,
    pub referrals: Vec<ConfirmedReferral>,
    pub pending: Vec<PendingReferral>,
    pub total_referrals: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedReferral {
    pub user_id: String,
    pub validated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReferral {
    pub user_id: String,
    pub joined_at: i64,
    #[serde(default)]
    pub validated: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ReferralTable {
    invites: BTreeMap<String, String>,
    users: BTreeMap<String, ReferrerRecord>,
}

/// A pending referral that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedReferral {
    pub referrer_id: u64,
    pub referred_id: u64,
    pub referred_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferralStats {
    pub invite_code: Option<String>,
    pub total_referrals: u32,
    pub validated: Vec<ConfirmedReferral>,
    pub pending: Vec<PendingReferral>,
}

/// Rewards unlocked by validated referrals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferralPerks {
    /// Applied to the AI rate limit; 999 lifts it.
    pub rate_limit_multiplier: u32,
    pub xp_cooldown: Duration,
    pub xp_multiplier: f64,
    pub bypass_moderation: bool,
    pub priority_access: bool,
    pub badge: Option<&'static str>,
}

impl Default for ReferralPerks {
    fn default() -> Self {
        Self {
            rate_limit_multiplier: 1,
            xp_cooldown: Duration::from_secs(60),
            xp_multiplier: 1.0,
            bypass_moderation: false,
            priority_access: false,
            badge: None,
        }
    }
}

impl ReferralPerks {
    /// Perks for a number of validated referrals. Tiers stack.
    pub fn for_count(count: u32) -> Self {
        let mut perks = Self::default();
        if count >= 1 {
            perks.rate_limit_multiplier = 2;
            perks.badge = Some("🤝");
        }
        if count >= 3 {
            perks.rate_limit_multiplier = 999;
            perks.xp_cooldown = Duration::from_secs(30);
        }
        if count >= 5 {
            perks.xp_multiplier = 1.25;
            perks.bypass_moderation = true;
        }
        if count >= 10 {
            perks.xp_multiplier = 1.5;
            perks.priority_access = true;
        }
        perks
    }
}

#[derive(Debug, Clone)]
pub struct ReferralLedger {
    core: LedgerCore,
}

impl ReferralLedger {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self {
            core: LedgerCore::new(keystore, STORE),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.core.clock = clock;
        self
    }

    pub async fn register_invite(&self, invite_code: &str, user_id: u64) {
        let user = user_id.to_string();
        let _guard = self.core.keystore.lock_store(STORE).await;
        let mut table: ReferralTable = self.core.load();
        table.invites.insert(invite_code.to_string(), user.clone());
        table.users.entry(user).or_default().invite_code = Some(invite_code.to_string());
        self.core.save(&table);
        tracing::info!("Registered invite {} for user {}", invite_code, user_id);
    }

    pub fn user_from_invite(&self, invite_code: &str) -> Option<u64> {
        let table: ReferralTable = self.core.load();
        table.invites.get(invite_code).and_then(|id| parse_id(id))
    }

    pub async fn add_pending_referral(&self, referrer_id: u64, referred_id: u64, joined_at_ms: i64) {
        let _guard = self.core.keystore.lock_store(STORE).await;
        let mut table: ReferralTable = self.core.load();
        let record = table.users.entry(referrer_id.to_string()).or_default();
        let referred = referred_id.to_string();
        if record.pending.iter().any(|p| p.user_id == referred) {
            return;
        }
        record.pending.push(PendingReferral {
            user_id: referred,
            joined_at: joined_at_ms,
            validated: false,
        });
        self.core.save(&table);
        tracing::info!(
            "Added pending referral: {} referred by {}",
            referred_id,
            referrer_id
        );
    }

    /// Who has `referred_id` as a pending referral.
    pub fn find_referrer(&self, referred_id: u64) -> Option<u64> {
        let referred = referred_id.to_string();
        let table: ReferralTable = self.core.load();
        table
            .users
            .iter()
            .find(|(_, record)| record.pending.iter().any(|p| p.user_id == referred))
            .and_then(|(referrer, _)| parse_id(referrer))
    }

    pub fn stats(&self, user_id: u64) -> ReferralStats {
        let mut table: ReferralTable = self.core.load();
        match table.users.remove(&user_id.to_string()) {
            Some(record) => ReferralStats {
                invite_code: record.invite_code,
                total_referrals: record.total_referrals,
                validated: record.referrals,
                pending: record.pending,
            },
            None => ReferralStats::default(),
        }
    }

    /// Top referrers with at least one validated referral.
    pub fn leaderboard(&self, limit: usize) -> Vec<(u64, u32)> {
        let table: ReferralTable = self.core.load();
        let mut board: Vec<(u64, u32)> = table
            .users
            .iter()
            .filter(|(_, record)| record.total_referrals > 0)
            .filter_map(|(user, record)| Some((parse_id(user)?, record.total_referrals)))
            .collect();
        board.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        board.truncate(limit);
        board
    }

    pub fn perks(&self, user_id: u64) -> ReferralPerks {
        ReferralPerks::for_count(self.stats(user_id).total_referrals)
    }

    /// Promote pending referrals that have been in the guild for a week and
    /// reached rank 2. Referrals of members who left are dropped; referrals
    /// whose lookup failed stay pending.
    pub async fn validate_pending(
        &self,
        guild_id: u64,
        members: &dyn MemberDirectory,
        xp: &XpLedger,
    ) -> Vec<ValidatedReferral> {
        let _guard = self.core.keystore.lock_store(STORE).await;
        let mut table: ReferralTable = self.core.load();
        let now = self.core.now();
        let mut validated = Vec::new();
        let mut dropped = 0;

        for (referrer, record) in table.users.iter_mut() {
            let mut still_pending = Vec::with_capacity(record.pending.len());
            for pending in std::mem::take(&mut record.pending) {
                let Some(referred_id) = parse_id(&pending.user_id) else {
                    dropped += 1;
                    continue;
                };
                let member = match members.member(guild_id, referred_id).await {
                    Ok(Some(member)) => member,
                    Ok(None) => {
                        tracing::info!("Referral failed: {} left the server", referred_id);
                        dropped += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Could not look up referred member {}: {}", referred_id, e);
                        still_pending.push(pending);
                        continue;
                    }
                };

                let old_enough = now - pending.joined_at >= VALIDATION_DELAY.as_millis() as i64;
                let ranked = rank_by_xp(xp.get_user_xp(guild_id, referred_id).xp).level
                    >= VALIDATION_MIN_LEVEL;
                if !(old_enough && ranked) {
                    still_pending.push(pending);
                    continue;
                }

                record.referrals.push(ConfirmedReferral {
                    user_id: pending.user_id,
                    validated_at: now,
                });
                record.total_referrals += 1;
                if let Some(referrer_id) = parse_id(referrer) {
                    tracing::info!(
                        "Validated referral: {} referred by {}",
                        referred_id,
                        referrer_id
                    );
                    validated.push(ValidatedReferral {
                        referrer_id,
                        referred_id,
                        referred_name: member.display_name,
                    });
                }
            }
            record.pending = still_pending;
        }

        if !validated.is_empty() || dropped > 0 {
            self.core.save(&table);
        }
        validated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{keystore, FakeGuild, TestClock};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const GUILD: u64 = 1;
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    #[tokio::test]
    async fn test_invites_and_pending() {
        let ks = keystore();
        let ledger = ReferralLedger::new(Arc::clone(&ks));
        ledger.register_invite("abc", 10).await;
        assert_eq!(ledger.user_from_invite("abc"), Some(10));
        assert_eq!(ledger.user_from_invite("zzz"), None);

        ledger.add_pending_referral(10, 20, 5).await;
        ledger.add_pending_referral(10, 20, 5).await;
        assert_eq!(ledger.find_referrer(20), Some(10));
        assert_eq!(ledger.find_referrer(21), None);

        let stats = ledger.stats(10);
        assert_eq!(stats.invite_code.as_deref(), Some("abc"));
        assert_eq!(stats.pending.len(), 1);

        assert_eq!(
            ks.get_store(STORE)["users"]["10"]["pending"][0],
            json!({"userId": "20", "joinedAt": 5, "validated": false})
        );
    }

    #[tokio::test]
    async fn test_validation_rules() {
        let ks = keystore();
        let clock = TestClock::at(10 * DAY_MS);
        let ledger = ReferralLedger::new(Arc::clone(&ks)).with_clock(clock.clock());
        let xp = XpLedger::new(Arc::clone(&ks));

        // 21: old enough and ranked; 22: ranked but too new;
        // 23: old enough but rank 1; 24: left the server
        ledger.add_pending_referral(10, 21, 2 * DAY_MS).await;
        ledger.add_pending_referral(10, 22, 5 * DAY_MS).await;
        ledger.add_pending_referral(10, 23, 1 * DAY_MS).await;
        ledger.add_pending_referral(10, 24, 1 * DAY_MS).await;
        xp.set_user_xp(GUILD, 21, 150).await;
        xp.set_user_xp(GUILD, 22, 150).await;
        xp.set_user_xp(GUILD, 23, 20).await;

        let mut guild = FakeGuild::default();
        for (id, name) in [(21, "ana"), (22, "bo"), (23, "cy")] {
            guild.members.insert(id, name.to_string());
        }

        let validated = ledger.validate_pending(GUILD, &guild, &xp).await;
        assert_eq!(
            validated,
            vec![ValidatedReferral {
                referrer_id: 10,
                referred_id: 21,
                referred_name: "ana".to_string(),
            }]
        );

        let stats = ledger.stats(10);
        assert_eq!(stats.total_referrals, 1);
        let pending: Vec<&str> = stats.pending.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(pending, vec!["22", "23"]);
        assert_eq!(ledger.perks(10).rate_limit_multiplier, 2);
    }

    #[tokio::test]
    async fn test_lookup_errors_keep_pending() {
        let ks = keystore();
        let clock = TestClock::at(30 * DAY_MS);
        let ledger = ReferralLedger::new(Arc::clone(&ks)).with_clock(clock.clock());
        let xp = XpLedger::new(Arc::clone(&ks));
        ledger.add_pending_referral(10, 21, 0).await;

        let guild = FakeGuild {
            broken: true,
            ..Default::default()
        };
        assert!(ledger.validate_pending(GUILD, &guild, &xp).await.is_empty());
        assert_eq!(ledger.stats(10).pending.len(), 1);
    }

    #[tokio::test]
    async fn test_leaderboard() {
        let ks = keystore();
        ks.set_store(
            STORE,
            json!({
                "invites": {},
                "users": {
                    "1": {"totalReferrals": 2},
                    "2": {"totalReferrals": 0},
                    "3": {"totalReferrals": 7, "inviteCode": "x"},
                }
            }),
        );
        let ledger = ReferralLedger::new(ks);
        assert_eq!(ledger.leaderboard(10), vec![(3, 7), (1, 2)]);
        assert_eq!(ledger.leaderboard(1), vec![(3, 7)]);
    }

    #[test]
    fn test_perk_tiers() {
        let none = ReferralPerks::for_count(0);
        assert_eq!(none, ReferralPerks::default());

        let one = ReferralPerks::for_count(1);
        assert_eq!(one.rate_limit_multiplier, 2);
        assert_eq!(one.badge, Some("🤝"));

        let three = ReferralPerks::for_count(3);
        assert_eq!(three.rate_limit_multiplier, 999);
        assert_eq!(three.xp_cooldown, Duration::from_secs(30));
        assert!(!three.bypass_moderation);

        let five = ReferralPerks::for_count(5);
        assert_eq!(five.xp_multiplier, 1.25);
        assert!(five.bypass_moderation);

        let ten = ReferralPerks::for_count(12);
        assert_eq!(ten.xp_multiplier, 1.5);
        assert!(ten.priority_access);
    }
}
