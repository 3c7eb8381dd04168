//! Rank role maintenance.
//!
//! Rank roles are matched by name against the rank table. A member holds at
//! most one of them.

use cafe_core::ranks::{is_rank_role, Rank, RANKS};
use serenity::all::{EditRole, GuildId, Http, Member, RoleId, UserId};

use crate::error::{DiscordError, Result};

/// Role edits needed to put a member on one rank.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RolePlan {
    pub add: Option<RoleId>,
    pub remove: Vec<RoleId>,
}

/// Work out the edits from the guild's roles and the member's current ones.
pub fn plan_rank_roles(guild_roles: &[(RoleId, String)], member_roles: &[RoleId], rank: &Rank) -> RolePlan {
    let target = guild_roles
        .iter()
        .find(|(_, name)| name == rank.name)
        .map(|(id, _)| *id);

    let remove = guild_roles
        .iter()
        .filter(|(id, name)| {
            Some(*id) != target && is_rank_role(name) && member_roles.contains(id)
        })
        .map(|(id, _)| *id)
        .collect();

    let add = target.filter(|id| !member_roles.contains(id));
    RolePlan { add, remove }
}

/// Ranks whose role is absent from the guild, lowest first.
pub fn missing_rank_roles(existing_names: &[String]) -> Vec<&'static Rank> {
    RANKS
        .iter()
        .filter(|rank| !existing_names.iter().any(|name| name == rank.name))
        .collect()
}

async fn guild_roles(http: &Http, guild_id: GuildId) -> Result<Vec<(RoleId, String)>> {
    Ok(guild_id
        .roles(http)
        .await?
        .into_iter()
        .map(|(id, role)| (id, role.name))
        .collect())
}

/// Create a role for every rank that lacks one. Returns the created names.
pub async fn create_rank_roles(http: &Http, guild_id: GuildId) -> Result<Vec<&'static str>> {
    let existing: Vec<String> = guild_roles(http, guild_id)
        .await?
        .into_iter()
        .map(|(_, name)| name)
        .collect();

    let mut created = Vec::new();
    for rank in missing_rank_roles(&existing) {
        let role = EditRole::new()
            .name(rank.name)
            .colour(rank.color)
            .hoist(false)
            .mentionable(false);
        guild_id.create_role(http, role).await?;
        tracing::info!("Created rank role {} in guild {}", rank.name, guild_id);
        created.push(rank.name);
    }
    Ok(created)
}

/// Outcome of [`sync_all_rank_roles`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RankSyncSummary {
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

async fn apply_plan(
    http: &Http,
    guild_roles: &[(RoleId, String)],
    member: &Member,
    rank: &Rank,
) -> Result<bool> {
    let plan = plan_rank_roles(guild_roles, &member.roles, rank);
    let user_id = member.user.id;

    for role in &plan.remove {
        member.remove_role(http, *role).await?;
    }
    if !plan.remove.is_empty() {
        tracing::info!("Removed {} old rank role(s) from {}", plan.remove.len(), user_id);
    }

    match plan.add {
        Some(role) => {
            member.add_role(http, role).await?;
            tracing::info!("Added rank role {} to {}", rank.name, user_id);
            Ok(true)
        }
        None if guild_roles.iter().any(|(_, name)| name == rank.name) => Ok(!plan.remove.is_empty()),
        None => Err(DiscordError::MissingRole(rank.name.to_string())),
    }
}

/// Put `user_id` on `rank`'s role, dropping any other rank role.
pub async fn sync_rank_role(http: &Http, guild_id: GuildId, user_id: UserId, rank: &Rank) -> Result<()> {
    let roles = guild_roles(http, guild_id).await?;
    let member = guild_id.member(http, user_id).await?;
    apply_plan(http, &roles, &member, rank).await.map(|_| ())
}

const MEMBER_PAGE: u64 = 1000;

/// Walk every human member of the guild and put them on the rank
/// `rank_of` gives them. Per-member failures are logged and counted.
pub async fn sync_all_rank_roles<F>(http: &Http, guild_id: GuildId, rank_of: F) -> Result<RankSyncSummary>
where
    F: Fn(UserId) -> &'static Rank,
{
    let roles = guild_roles(http, guild_id).await?;
    let mut summary = RankSyncSummary::default();
    let mut after = None;
    loop {
        let page = guild_id.members(http, Some(MEMBER_PAGE), after).await?;
        for member in page.iter().filter(|m| !m.user.bot) {
            match apply_plan(http, &roles, member, rank_of(member.user.id)).await {
                Ok(true) => summary.updated += 1,
                Ok(false) => summary.unchanged += 1,
                Err(e) => {
                    tracing::warn!("Rank role sync failed for {}: {}", member.user.id, e);
                    summary.failed += 1;
                }
            }
        }
        match page.last() {
            Some(last) if page.len() as u64 == MEMBER_PAGE => after = Some(last.user.id),
            _ => break,
        }
    }
    tracing::info!(
        "Rank roles synced in guild {}: {} updated, {} unchanged, {} failed",
        guild_id,
        summary.updated,
        summary.unchanged,
        summary.failed
    );
    Ok(summary)
}
