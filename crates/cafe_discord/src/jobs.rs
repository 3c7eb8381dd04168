//! Background maintenance jobs.
//!
//! Each job is a spawned task on a fixed interval, registered on the
//! [`BotContext`] so shutdown can abort it.

use std::sync::Arc;
use std::time::Duration;

use cafe_core::keystore::MessageBackend;
use cafe_core::ledger::ValidatedReferral;
use serenity::all::{GuildId, Http, UserId};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::{GuildDirectory, SerenityBackend};
use crate::context::BotContext;
use crate::handler::send_dm;

/// Spawn every job and hand the handles to the context.
pub fn spawn_all(bot: &Arc<BotContext>, http: Arc<Http>, bot_id: UserId, guilds: Vec<GuildId>) {
    let messages: Arc<dyn MessageBackend> =
        Arc::new(SerenityBackend::new(Arc::clone(&http), bot_id.get()));
    bot.register_job(spawn_deletion_sweep(
        Arc::clone(bot),
        messages,
        Duration::from_secs(bot.config.jobs.deletion_sweep_secs.max(1)),
    ));
    bot.register_job(spawn_referral_validation(
        Arc::clone(bot),
        http,
        guilds,
        Duration::from_secs(bot.config.jobs.referral_validation_mins.max(1) * 60),
    ));
    tracing::info!("Background jobs started");
}

/// Delete scheduled messages once they are due.
pub fn spawn_deletion_sweep(
    bot: Arc<BotContext>,
    messages: Arc<dyn MessageBackend>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let run = bot.deletions.process_due(messages.as_ref()).await;
            if run.deleted > 0 || run.failed > 0 {
                tracing::info!(
                    "Deletion sweep: {} deleted, {} failed, {} remaining",
                    run.deleted,
                    run.failed,
                    run.remaining
                );
            }
        }
    })
}

/// Promote pending referrals and drop stale reaction-role mappings. The
/// first pass runs right away.
pub fn spawn_referral_validation(
    bot: Arc<BotContext>,
    http: Arc<Http>,
    guilds: Vec<GuildId>,
    period: Duration,
) -> JoinHandle<()> {
    let directory = GuildDirectory::new(Arc::clone(&http));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for guild_id in &guilds {
                let validated = bot
                    .referrals
                    .validate_pending(guild_id.get(), &directory, &bot.xp)
                    .await;
                for referral in &validated {
                    notify_referrer(&http, &bot, referral).await;
                }
                if !validated.is_empty() {
                    tracing::info!("Validated {} referral(s) in guild {}", validated.len(), guild_id);
                }
            }

            let dropped = bot.role_reactions.cleanup(&directory).await;
            if dropped > 0 {
                tracing::info!("Removed {} reaction role(s) pointing at deleted roles", dropped);
            }
        }
    })
}

async fn notify_referrer(http: &Http, bot: &BotContext, referral: &ValidatedReferral) {
    if referral.referrer_id == 0 {
        return;
    }
    let total = bot.referrals.stats(referral.referrer_id).total_referrals;
    let content = format!(
        "🎉 Félicitations ! **{}** est maintenant ton filleul validé !\n\n\
         Tu as maintenant **{}** filleul{} validé{}. Merci de faire grandir la communauté ! ☕",
        referral.referred_name,
        total,
        if total > 1 { "s" } else { "" },
        if total > 1 { "s" } else { "" },
    );
    if let Err(e) = send_dm(http, UserId::new(referral.referrer_id), content).await {
        tracing::warn!("Could not DM referrer {}: {}", referral.referrer_id, e);
    }
}
