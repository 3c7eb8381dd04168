//! Gateway event handling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cafe_core::ai::{format_channel_history, HistoryLine, ModerationDecision};
use cafe_core::ledger::cooldown::MAX_REQUESTS_PER_WINDOW;
use cafe_core::ledger::xp::{apply_multiplier, random_xp_between};
use cafe_core::ranks::{next_rank, RANKS};
use cafe_core::sanitize::{sanitize_mentions, truncate_chars, truncate_utf16};
use serenity::all::{
    ChannelId, Colour, Command, Context, CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter,
    CreateMessage, EditMember, EventHandler, GetMessages, GuildId, Http, Interaction, Member,
    Message, Reaction, ReactionType, Ready, RoleId, Timestamp, UserId,
};
use serenity::async_trait;

use crate::context::BotContext;
use crate::invites::InviteTracker;
use crate::jobs;
use crate::roles::sync_rank_role;
use crate::slash_commands;

/// Rank-up announcements are removed after this long.
const RANK_UP_MESSAGE_TTL: Duration = Duration::from_secs(15);

/// Discord's message length ceiling.
const MAX_REPLY_UNITS: usize = 2000;

/// Remove `<@id>` and `<@!id>` mentions of the bot and trim.
pub fn strip_bot_mentions(content: &str, bot_id: u64) -> String {
    content
        .replace(&format!("<@{bot_id}>"), "")
        .replace(&format!("<@!{bot_id}>"), "")
        .trim()
        .to_string()
}

/// Key used to look a reaction up in the role-reaction ledger.
pub fn emoji_key(emoji: &ReactionType) -> Option<String> {
    match emoji {
        ReactionType::Unicode(unicode) => Some(unicode.clone()),
        ReactionType::Custom { name, .. } => name.clone(),
        _ => None,
    }
}

/// `HH:MM:SS` in local time.
fn clock_time(unix_secs: i64) -> String {
    chrono::DateTime::from_timestamp(unix_secs, 0)
        .map(|at| at.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Recent messages of a channel, oldest first, skipping other bots.
pub(crate) async fn channel_history(
    http: &Http,
    channel_id: ChannelId,
    limit: u8,
    bot_id: UserId,
) -> serenity::Result<Vec<HistoryLine>> {
    let mut messages = channel_id
        .messages(http, GetMessages::new().limit(limit.clamp(1, 100)))
        .await?;
    messages.reverse();
    Ok(messages
        .into_iter()
        .filter(|m| !m.author.bot || m.author.id == bot_id)
        .map(|m| HistoryLine {
            time: clock_time(m.timestamp.unix_timestamp()),
            author: m.author.name,
            content: m.content,
        })
        .collect())
}

pub(crate) async fn send_dm(http: &Http, user_id: UserId, content: impl Into<String>) -> serenity::Result<()> {
    let channel = user_id.create_dm_channel(http).await?;
    channel
        .send_message(http, CreateMessage::new().content(content))
        .await?;
    Ok(())
}

pub struct CafeHandler {
    bot: Arc<BotContext>,
    invites: InviteTracker,
    bot_id: AtomicU64,
    started: AtomicBool,
}

impl CafeHandler {
    pub fn new(bot: Arc<BotContext>) -> Self {
        Self {
            bot,
            invites: InviteTracker::new(),
            bot_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Our own user, once the gateway said who we are.
    fn bot_user(&self) -> Option<UserId> {
        match self.bot_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(UserId::new(id)),
        }
    }

    async fn register_commands(&self, ctx: &Context) {
        let commands = slash_commands::create_commands();
        let count = commands.len();
        let result = match self.bot.config.discord.guild_id.filter(|id| *id != 0) {
            Some(guild_id) => GuildId::new(guild_id).set_commands(&ctx.http, commands).await,
            None => Command::set_global_commands(&ctx.http, commands).await,
        };
        match result {
            Ok(_) => tracing::info!("Registered {} slash commands", count),
            Err(e) => tracing::error!("Failed to register slash commands: {}", e),
        }
    }

    async fn award_xp(&self, ctx: &Context, msg: &Message, guild_id: GuildId) {
        let user_id = msg.author.id.get();
        let xp_config = &self.bot.config.xp;
        let perks = self.bot.referrals.perks(user_id);
        let cooldown = perks
            .xp_cooldown
            .min(Duration::from_secs(xp_config.cooldown_secs));

        let amount = apply_multiplier(
            random_xp_between(xp_config.min_message_xp, xp_config.max_message_xp),
            perks.xp_multiplier,
        );
        let Some(gain) = self
            .bot
            .xp
            .award_message_xp(guild_id.get(), user_id, amount, cooldown)
            .await
        else {
            return;
        };
        if !gain.leveled_up {
            return;
        }
        tracing::info!("{} ranked up to {}", msg.author.tag(), gain.new_rank.name);

        if let Err(e) = sync_rank_role(&ctx.http, guild_id, msg.author.id, gain.new_rank).await {
            tracing::warn!("Failed to update rank role for {}: {}", msg.author.tag(), e);
        }
        if let Err(e) = msg
            .react(&ctx.http, ReactionType::Unicode(gain.new_rank.emoji.to_string()))
            .await
        {
            tracing::warn!("Failed to add rank emoji reaction: {}", e);
        }

        let mut description = format!(
            "**Félicitations {}!**\n\nTu as atteint le rang **{}**!\n*{}*",
            msg.author.name, gain.new_rank.name, gain.new_rank.description
        );
        description.push_str(&format!(
            "\n\n{} → {}\nLevel **{}**/{} • **{} XP**",
            gain.old_rank.name,
            gain.new_rank.name,
            gain.new_rank.level,
            RANKS.len(),
            gain.total_xp
        ));
        let footer = match next_rank(gain.new_rank.level) {
            Some(next) => format!(
                "Prochain rang: {} ({} XP restants)",
                next.name,
                next.xp_required.saturating_sub(gain.total_xp)
            ),
            None => "Rang le plus élevé atteint! 🎉".to_string(),
        };
        let embed = CreateEmbed::new()
            .title("🎉 Nouveau Rang Débloqué!")
            .colour(Colour::new(gain.new_rank.color))
            .thumbnail(msg.author.face())
            .description(description)
            .footer(CreateEmbedFooter::new(footer))
            .timestamp(Timestamp::now());

        let channel = self
            .bot
            .config
            .xp
            .announce_channel_id
            .filter(|id| *id != 0)
            .map(ChannelId::new)
            .unwrap_or(msg.channel_id);
        match channel
            .send_message(
                &ctx.http,
                CreateMessage::new()
                    .content(format!("<@{}>", msg.author.id))
                    .embed(embed),
            )
            .await
        {
            Ok(sent) => {
                self.bot
                    .deletions
                    .schedule(guild_id.get(), channel.get(), sent.id.get(), RANK_UP_MESSAGE_TTL)
                    .await;
            }
            Err(e) => tracing::error!("Failed to send level up message: {}", e),
        }
    }

    async fn answer_mention(&self, ctx: &Context, msg: &Message, guild_id: GuildId, bot_id: UserId) {
        // Several instances may see the same message.
        if !self.bot.cooldowns.claim_message(msg.id.get()).await {
            return;
        }

        let user_id = msg.author.id.get();
        let question = strip_bot_mentions(&msg.content, bot_id.get());
        if question.is_empty() {
            if let Err(e) = msg.react(&ctx.http, ReactionType::Unicode("❓".to_string())).await {
                tracing::warn!("Failed to react to empty mention: {}", e);
            }
            return;
        }

        if let Some(left) = self.bot.cooldowns.bot_cooldown_remaining(user_id).await {
            tracing::info!(
                "{} is on bot cooldown ({} min remaining)",
                msg.author.tag(),
                left.as_secs().div_ceil(60)
            );
            return;
        }

        let lines = match channel_history(
            &ctx.http,
            msg.channel_id,
            self.bot.config.ai.history_messages,
            bot_id,
        )
        .await
        {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!("Could not fetch history for {}: {}", msg.channel_id, e);
                Vec::new()
            }
        };
        let history = format_channel_history(&lines);

        let perks = self.bot.referrals.perks(user_id);
        if !perks.bypass_moderation {
            match self
                .bot
                .moderator
                .moderate(user_id, &msg.author.name, &question, &history)
                .await
            {
                ModerationDecision::Allow => {}
                ModerationDecision::Cooldown { minutes, reason } => {
                    tracing::info!("Bot cooldown {}min applied to {}", minutes, msg.author.tag());
                    self.log_moderation(ctx, msg, "COOLDOWN", minutes, &question, &reason)
                        .await;
                    return;
                }
                ModerationDecision::Mute { minutes, reason } => {
                    self.timeout_member(ctx, msg, guild_id, minutes, &question, &reason)
                        .await;
                    return;
                }
            }
        }

        let status = self
            .bot
            .cooldowns
            .check_rate_limit(user_id, perks.rate_limit_multiplier)
            .await;
        if !status.allowed {
            if !self.bot.cooldowns.is_warned(user_id).await {
                let wait = status
                    .retry_after_label()
                    .unwrap_or_else(|| "quelques minutes".to_string());
                let warning = format!(
                    "⚠️ Doucement ! Tu as utilisé tes {} questions. Réessaie dans **{}** ⏳",
                    MAX_REQUESTS_PER_WINDOW.saturating_mul(perks.rate_limit_multiplier.max(1)),
                    wait
                );
                if let Err(e) = msg.reply(&ctx.http, warning).await {
                    tracing::warn!("Failed to send rate limit warning: {}", e);
                }
                self.bot.cooldowns.set_warned(user_id).await;
            }
            return;
        }

        self.bot.cooldowns.record_request(user_id).await;
        if let Err(e) = msg.channel_id.broadcast_typing(&ctx.http).await {
            tracing::debug!("Typing indicator failed: {}", e);
        }
        tracing::info!("{} asked: {}", msg.author.tag(), truncate_chars(&question, 100));

        match self.bot.assistant.answer(&question, &history).await {
            Ok(answer) => {
                let answer = sanitize_mentions(&answer);
                match msg
                    .reply(&ctx.http, truncate_utf16(&answer, MAX_REPLY_UNITS))
                    .await
                {
                    Ok(_) => tracing::info!("Responded to {}", msg.author.tag()),
                    Err(e) => tracing::error!("Failed to send answer: {}", e),
                }
            }
            Err(e) => {
                tracing::error!("Error answering mention: {}", e);
                let content = if e.is_timeout() {
                    "⏱️ La réponse a pris trop de temps. Réessaie plus tard !"
                } else {
                    "❌ Désolé, je n'ai pas pu traiter ta question. Réessaie plus tard !"
                };
                if let Err(e) = msg.reply(&ctx.http, content).await {
                    tracing::error!("Failed to send error message: {}", e);
                }
                self.bot.cooldowns.undo_last_request(user_id).await;
            }
        }
    }

    async fn timeout_member(
        &self,
        ctx: &Context,
        msg: &Message,
        guild_id: GuildId,
        minutes: u64,
        question: &str,
        reason: &str,
    ) {
        let until = chrono::Utc::now().timestamp() + (minutes as i64) * 60;
        let Ok(until) = Timestamp::from_unix_timestamp(until) else {
            tracing::error!("Invalid timeout of {} minutes", minutes);
            return;
        };
        let audit_reason = format!("Modération automatique: {}", reason);
        match guild_id
            .edit_member(
                &ctx.http,
                msg.author.id,
                EditMember::new()
                    .disable_communication_until_datetime(until)
                    .audit_log_reason(&audit_reason),
            )
            .await
        {
            Ok(_) => {
                tracing::info!("Timed out {} for {} minutes", msg.author.tag(), minutes);
                self.log_moderation(ctx, msg, "MUTE", minutes, question, reason)
                    .await;
            }
            Err(e) => tracing::error!("Failed to timeout {}: {}", msg.author.tag(), e),
        }
    }

    async fn log_moderation(
        &self,
        ctx: &Context,
        msg: &Message,
        action: &str,
        minutes: u64,
        question: &str,
        reason: &str,
    ) {
        let Some(channel) = self
            .bot
            .config
            .discord
            .moderation_log_channel_id
            .filter(|id| *id != 0)
            .map(ChannelId::new)
        else {
            return;
        };
        let (title, colour) = match action {
            "MUTE" => ("🔇 Timeout Discord", Colour::new(0xe74c3c)),
            _ => ("⏸️ Cooldown Bot", Colour::new(0xf39c12)),
        };
        let embed = CreateEmbed::new()
            .author(CreateEmbedAuthor::new(msg.author.tag()).icon_url(msg.author.face()))
            .title(title)
            .colour(colour)
            .field("Durée", format!("{} minute(s)", minutes), true)
            .field("Salon", format!("<#{}>", msg.channel_id), true)
            .field("Raison", reason, false)
            .field("Message", truncate_utf16(question, 1000), false)
            .footer(CreateEmbedFooter::new(format!("User ID: {}", msg.author.id)))
            .timestamp(Timestamp::now());
        if let Err(e) = channel
            .send_message(&ctx.http, CreateMessage::new().embed(embed))
            .await
        {
            tracing::warn!("Failed to post moderation log: {}", e);
        }
    }

    async fn track_referral(&self, ctx: &Context, member: &Member) {
        let Some(code) = self.invites.detect_used(&ctx.http, member.guild_id).await else {
            tracing::info!("{} joined but the invite used is unknown", member.user.tag());
            return;
        };
        tracing::info!("{} joined using invite {}", member.user.tag(), code);

        let Some(referrer) = self.bot.referrals.user_from_invite(&code) else {
            return;
        };
        if referrer == member.user.id.get() || referrer == 0 {
            return;
        }
        self.bot
            .referrals
            .add_pending_referral(referrer, member.user.id.get(), chrono::Utc::now().timestamp_millis())
            .await;
        tracing::info!("{} was referred by {}", member.user.tag(), referrer);

        let tag = member.user.tag();
        let notice = format!(
            "🎉 Quelqu'un a rejoint le serveur avec ton lien de parrainage !\n\n\
             **Nouveau membre :** {tag}\n\
             Il sera validé comme filleul après 7 jours s'il remplit les conditions. ⏳\n\n\
             💡 **Astuce :** Si {tag} a des questions, encourage-le à te contacter directement."
        );
        if let Err(e) = send_dm(&ctx.http, UserId::new(referrer), notice).await {
            tracing::warn!("Could not DM referrer {}: {}", referrer, e);
        }
    }

    async fn apply_reaction_role(&self, ctx: &Context, reaction: &Reaction, grant: bool) {
        let (Some(guild_id), Some(user_id)) = (reaction.guild_id, reaction.user_id) else {
            return;
        };
        if Some(user_id) == self.bot_user() {
            return;
        }
        let Some(emoji) = emoji_key(&reaction.emoji) else {
            return;
        };
        let Some(role_id) = self
            .bot
            .role_reactions
            .role_for_reaction(reaction.message_id.get(), &emoji)
            .filter(|id| *id != 0)
            .map(RoleId::new)
        else {
            return;
        };

        let is_bot = match &reaction.member {
            Some(member) => member.user.bot,
            None => match reaction.user(&ctx).await {
                Ok(user) => user.bot,
                Err(e) => {
                    tracing::warn!("Could not fetch reacting user {}: {}", user_id, e);
                    return;
                }
            },
        };
        if is_bot {
            return;
        }

        let result = if grant {
            ctx.http
                .add_member_role(guild_id, user_id, role_id, Some("Rôle par réaction"))
                .await
        } else {
            ctx.http
                .remove_member_role(guild_id, user_id, role_id, Some("Rôle par réaction"))
                .await
        };
        match result {
            Ok(()) => tracing::info!(
                "{} role {} for {} via {}",
                if grant { "Added" } else { "Removed" },
                role_id,
                user_id,
                emoji
            ),
            Err(e) => tracing::error!("Failed to update reaction role {}: {}", role_id, e),
        }
    }
}

impl std::fmt::Debug for CafeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CafeHandler")
            .field("bot_id", &self.bot_id)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventHandler for CafeHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("Connected as {}", ready.user.name);
        self.bot_id.store(ready.user.id.get(), Ordering::Relaxed);
        self.register_commands(&ctx).await;

        let guilds: Vec<GuildId> = ready.guilds.iter().map(|g| g.id).collect();
        for guild_id in &guilds {
            if self.invites.refresh(&ctx.http, *guild_id).await.is_some() {
                tracing::info!("Initialized invite cache for guild {}", guild_id);
            }
        }

        // Gateway reconnects fire `ready` again.
        if !self.started.swap(true, Ordering::SeqCst) {
            jobs::spawn_all(&self.bot, Arc::clone(&ctx.http), ready.user.id, guilds);
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        let Some(bot_id) = self.bot_user() else {
            return;
        };

        if msg.mentions_user_id(bot_id) {
            // Mentions earn no XP.
            self.answer_mention(&ctx, &msg, guild_id, bot_id).await;
            return;
        }
        self.award_xp(&ctx, &msg, guild_id).await;
    }

    async fn guild_member_addition(&self, ctx: Context, new_member: Member) {
        self.track_referral(&ctx, &new_member).await;

        let first_rank = &RANKS[0];
        match sync_rank_role(&ctx.http, new_member.guild_id, new_member.user.id, first_rank).await {
            Ok(()) => tracing::info!("Assigned {} to {}", first_rank.name, new_member.user.tag()),
            Err(e) => tracing::warn!(
                "Could not assign default rank to {}: {}",
                new_member.user.tag(),
                e
            ),
        }
    }

    async fn reaction_add(&self, ctx: Context, reaction: Reaction) {
        self.apply_reaction_role(&ctx, &reaction, true).await;
    }

    async fn reaction_remove(&self, ctx: Context, reaction: Reaction) {
        self.apply_reaction_role(&ctx, &reaction, false).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        if let Err(e) = slash_commands::dispatch(&ctx, &command, &self.bot, self.bot_user()).await {
            tracing::error!("Command /{} failed: {:?}", command.data.name, e);
        }
    }
}
