//! Discord slash command implementations

use cafe_core::ai::format_channel_history;
use cafe_core::ranks::{next_rank, rank_by_xp, rank_progress, xp_to_next_rank, RANKS};
use cafe_core::sanitize::{sanitize_mentions, truncate_chars, truncate_utf16};
use miette::Result;
use serenity::{
    all::{
        ChannelId, CommandDataOption, CommandDataOptionValue, CreateInvite, CreateMessage,
        EditInteractionResponse, GuildId, GetMessages, ReactionType, Timestamp, UserId,
    },
    builder::{
        CreateCommand, CreateCommandOption, CreateEmbed, CreateEmbedFooter,
        CreateInteractionResponse, CreateInteractionResponseMessage,
    },
    client::Context,
    model::{
        application::{CommandInteraction, CommandOptionType},
        colour::Colour,
        permissions::Permissions,
    },
};

use crate::context::BotContext;
use crate::discussion::{scored_questions, DISCUSSION_TITLE, DOWNVOTE, UPVOTE};
use crate::handler::channel_history;
use crate::roles::{create_rank_roles, sync_all_rank_roles, sync_rank_role};

const COFFEE_BROWN: Colour = Colour::new(0x6d4c41);
const BLURPLE: Colour = Colour::new(0x5865f2);

/// Create all slash commands for registration
pub fn create_commands() -> Vec<CreateCommand> {
    let target_user = |description: &str, required: bool| {
        CreateCommandOption::new(CommandOptionType::User, "utilisateur", description)
            .required(required)
    };

    vec![
        CreateCommand::new("rangs")
            .description("Affiche tous les rangs disponibles et ta progression")
            .dm_permission(false)
            .add_option(target_user("Voir les rangs d'un autre utilisateur", false)),
        CreateCommand::new("leaderboard")
            .description("Affiche le classement des membres les plus actifs")
            .dm_permission(false)
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Integer,
                    "limite",
                    "Nombre de membres à afficher (par défaut: 10)",
                )
                .min_int_value(5)
                .max_int_value(25)
                .required(false),
            ),
        CreateCommand::new("parrainage")
            .description("Génère ton lien de parrainage unique")
            .dm_permission(false),
        CreateCommand::new("filleuls")
            .description("Affiche tes filleuls validés et en attente")
            .dm_permission(false),
        CreateCommand::new("question")
            .description("Pose une question à l'IA sur les derniers messages du salon")
            .dm_permission(false)
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "question",
                    "Ta question sur la conversation",
                )
                .required(true),
            ),
        CreateCommand::new("discussion")
            .description("Poste une question de discussion générée pour ce salon")
            .dm_permission(false)
            .default_member_permissions(Permissions::MANAGE_MESSAGES),
        CreateCommand::new("keystore-stats")
            .description("Affiche les statistiques du système de stockage Discord")
            .dm_permission(false)
            .default_member_permissions(Permissions::ADMINISTRATOR),
        CreateCommand::new("remove-cooldown")
            .description("Retirer le cooldown bot d'un utilisateur")
            .dm_permission(false)
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(target_user("L'utilisateur dont retirer le cooldown", true)),
        CreateCommand::new("manage-xp")
            .description("Gérer l'XP des utilisateurs")
            .dm_permission(false)
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "set",
                    "Définir l'XP d'un utilisateur",
                )
                .add_sub_option(target_user("L'utilisateur à modifier", true))
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::Integer, "xp", "Montant d'XP à définir")
                        .min_int_value(0)
                        .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "add",
                    "Ajouter de l'XP à un utilisateur",
                )
                .add_sub_option(target_user("L'utilisateur à modifier", true))
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::Integer, "xp", "Montant d'XP à ajouter")
                        .min_int_value(1)
                        .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "view",
                    "Voir l'XP d'un utilisateur",
                )
                .add_sub_option(target_user("L'utilisateur à consulter", true)),
            ),
        CreateCommand::new("setup-ranks")
            .description("Crée les rôles de rang manquants sur le serveur")
            .dm_permission(false)
            .default_member_permissions(Permissions::ADMINISTRATOR),
        CreateCommand::new("sync-ranks")
            .description("Réattribue à chaque membre le rôle de son rang")
            .dm_permission(false)
            .default_member_permissions(Permissions::ADMINISTRATOR),
    ]
}

/// Route a command interaction to its handler.
pub async fn dispatch(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
    bot_id: Option<UserId>,
) -> Result<()> {
    match command.data.name.as_str() {
        "rangs" => handle_rangs_command(ctx, command, bot).await,
        "leaderboard" => handle_leaderboard_command(ctx, command, bot).await,
        "parrainage" => handle_parrainage_command(ctx, command, bot).await,
        "filleuls" => handle_filleuls_command(ctx, command, bot).await,
        "question" => handle_question_command(ctx, command, bot, bot_id).await,
        "discussion" => handle_discussion_command(ctx, command, bot, bot_id).await,
        "keystore-stats" => handle_keystore_stats_command(ctx, command, bot).await,
        "remove-cooldown" => handle_remove_cooldown_command(ctx, command, bot).await,
        "manage-xp" => handle_manage_xp_command(ctx, command, bot).await,
        "setup-ranks" => handle_setup_ranks_command(ctx, command, bot).await,
        "sync-ranks" => handle_sync_ranks_command(ctx, command, bot).await,
        other => {
            tracing::warn!("Unknown command: {}", other);
            Ok(())
        }
    }
}

fn find_option<'a>(options: &'a [CommandDataOption], name: &str) -> Option<&'a CommandDataOptionValue> {
    options.iter().find(|o| o.name == name).map(|o| &o.value)
}

/// Draw `percent` as a bar of `width` cells.
pub fn progress_bar(percent: u8, width: usize) -> String {
    let filled = (usize::from(percent.min(100)) * width).div_ceil(100).min(width);
    format!("{}{}", "▰".repeat(filled), "▱".repeat(width - filled))
}

fn plural(count: usize) -> &'static str {
    if count > 1 {
        "s"
    } else {
        ""
    }
}

async fn respond(ctx: &Context, command: &CommandInteraction, content: impl Into<String>) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await
        .map_err(|e| miette::miette!("Failed to send response: {}", e))
}

async fn edit(ctx: &Context, command: &CommandInteraction, reply: EditInteractionResponse) -> Result<()> {
    command
        .edit_response(&ctx.http, reply)
        .await
        .map(|_| ())
        .map_err(|e| miette::miette!("Failed to edit response: {}", e))
}

/// Owners-only gate. Returns false after telling the user off.
async fn require_owner(ctx: &Context, command: &CommandInteraction, bot: &BotContext) -> Result<bool> {
    if bot.config.discord.is_owner(command.user.id.get()) {
        return Ok(true);
    }
    respond(
        ctx,
        command,
        "❌ Cette commande est réservée aux administrateurs du bot.",
    )
    .await?;
    Ok(false)
}

async fn require_guild(ctx: &Context, command: &CommandInteraction) -> Result<Option<GuildId>> {
    match command.guild_id {
        Some(guild_id) => Ok(Some(guild_id)),
        None => {
            respond(ctx, command, "❌ Cette commande doit être utilisée sur un serveur.").await?;
            Ok(None)
        }
    }
}

/// Handle the /rangs command
pub async fn handle_rangs_command(ctx: &Context, command: &CommandInteraction, bot: &BotContext) -> Result<()> {
    let Some(guild_id) = require_guild(ctx, command).await? else {
        return Ok(());
    };
    let target = find_option(&command.data.options, "utilisateur")
        .and_then(CommandDataOptionValue::as_user_id)
        .unwrap_or(command.user.id);
    let own_profile = target == command.user.id;
    let target_name = match target.to_user(&ctx.http).await {
        Ok(user) => user.name,
        Err(_) => target.to_string(),
    };

    let xp = bot.xp.get_user_xp(guild_id.get(), target.get()).xp;
    let current = rank_by_xp(xp);
    let mut status = format!("Level **{}**/{} • **{}** XP", current.level, RANKS.len(), xp);
    match next_rank(current.level) {
        Some(next) => {
            let progress = rank_progress(xp);
            status.push_str(&format!(
                "\n\n{} **{}%**\n{} XP → {}",
                progress_bar(progress, 15),
                progress,
                xp_to_next_rank(xp),
                next.name
            ));
        }
        None => status.push_str("\n\n🎉 **Rang maximum!**"),
    }

    let ladder = |ranks: &[cafe_core::Rank]| {
        ranks
            .iter()
            .map(|rank| {
                let marker = if rank.level == current.level {
                    "📍"
                } else if xp >= rank.xp_required {
                    "✅"
                } else {
                    "🔒"
                };
                format!("{} **{}**\n`{} XP`", marker, rank.name, rank.xp_required)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let midpoint = RANKS.len().div_ceil(2);

    let author = if own_profile {
        target_name
    } else {
        format!("Profil de {}", target_name)
    };
    let embed = CreateEmbed::new()
        .title(format!("{} {}", current.emoji, current.name))
        .author(serenity::builder::CreateEmbedAuthor::new(author))
        .colour(Colour::new(current.color))
        .description(status)
        .field("\u{200B}", ladder(&RANKS[..midpoint]), true)
        .field("\u{200B}", ladder(&RANKS[midpoint..]), true)
        .footer(CreateEmbedFooter::new("Gagnez de l'XP en participant au serveur!"))
        .timestamp(Timestamp::now());

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await
        .map_err(|e| miette::miette!("Failed to send rangs response: {}", e))?;
    Ok(())
}

/// Handle the /leaderboard command
pub async fn handle_leaderboard_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
) -> Result<()> {
    let Some(guild_id) = require_guild(ctx, command).await? else {
        return Ok(());
    };
    let limit = find_option(&command.data.options, "limite")
        .and_then(CommandDataOptionValue::as_i64)
        .unwrap_or(10)
        .clamp(5, 25) as usize;

    command
        .defer(&ctx.http)
        .await
        .map_err(|e| miette::miette!("Failed to defer leaderboard: {}", e))?;

    let everyone = bot.xp.leaderboard(guild_id.get(), usize::MAX);
    if everyone.is_empty() {
        return edit(
            ctx,
            command,
            EditInteractionResponse::new().content(
                "☕ Aucun membre n'a encore d'XP. Commencez à discuter pour gagner de l'expérience!",
            ),
        )
        .await;
    }

    const MEDALS: [&str; 3] = ["🥇", "🥈", "🥉"];
    let mut board = String::new();
    for (i, entry) in everyone.iter().take(limit).enumerate() {
        let position = MEDALS
            .get(i)
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("**{}.**", i + 1));
        let name = match UserId::new(entry.user_id).to_user(&ctx.http).await {
            Ok(user) => user.name,
            Err(e) => {
                tracing::warn!("Could not fetch user {}: {}", entry.user_id, e);
                continue;
            }
        };
        board.push_str(&format!(
            "{} **{}**\n   {} {} • {} XP\n   💬 {} messages\n\n",
            position, name, entry.rank.emoji, entry.rank.name, entry.xp, entry.message_count
        ));
    }

    let shown = everyone.len().min(limit);
    let mut embed = CreateEmbed::new()
        .title("🏆 Classement du Serveur")
        .colour(COFFEE_BROWN)
        .description(if board.is_empty() { "Classement vide".to_string() } else { board })
        .footer(CreateEmbedFooter::new(format!("Top {} membres", shown)))
        .timestamp(Timestamp::now());

    let caller = command.user.id.get();
    if let Some((position, entry)) = everyone
        .iter()
        .enumerate()
        .find(|(_, e)| e.user_id == caller)
        .filter(|(position, _)| *position >= limit)
    {
        embed = embed.field(
            "📍 Ta Position",
            format!(
                "**Position #{}**\n{} {} • {} XP\n💬 {} messages",
                position + 1,
                entry.rank.emoji,
                entry.rank.name,
                entry.xp,
                entry.message_count
            ),
            false,
        );
    }

    edit(ctx, command, EditInteractionResponse::new().embed(embed)).await
}

/// Handle the /parrainage command
pub async fn handle_parrainage_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
) -> Result<()> {
    let Some(guild_id) = require_guild(ctx, command).await? else {
        return Ok(());
    };
    command
        .defer_ephemeral(&ctx.http)
        .await
        .map_err(|e| miette::miette!("Failed to defer parrainage: {}", e))?;

    let user_id = command.user.id.get();
    let stats = bot.referrals.stats(user_id);

    let existing = match &stats.invite_code {
        Some(code) => match guild_id.invites(&ctx.http).await {
            Ok(invites) => invites.iter().any(|i| &i.code == code).then(|| code.clone()),
            Err(e) => {
                tracing::warn!("Could not list invites of {}: {}", guild_id, e);
                None
            }
        },
        None => None,
    };

    let code = match existing {
        Some(code) => code,
        None => {
            if let Some(old) = &stats.invite_code {
                tracing::info!("Invite {} expired for user {}, creating new one", old, user_id);
            }
            let invite = command
                .channel_id
                .create_invite(
                    &ctx.http,
                    CreateInvite::new()
                        .max_age(0)
                        .max_uses(0)
                        .unique(true)
                        .audit_log_reason(&format!("Lien de parrainage pour {}", command.user.tag())),
                )
                .await;
            match invite {
                Ok(invite) => {
                    bot.referrals.register_invite(&invite.code, user_id).await;
                    tracing::info!("Created referral invite {} for {}", invite.code, command.user.tag());
                    invite.code
                }
                Err(e) => {
                    tracing::error!("Error creating referral invite: {}", e);
                    return edit(
                        ctx,
                        command,
                        EditInteractionResponse::new()
                            .content("❌ Je n'ai pas la permission de créer des invitations sur ce serveur."),
                    )
                    .await;
                }
            }
        }
    };

    let embed = CreateEmbed::new()
        .title("🤝 Ton Lien de Parrainage")
        .colour(COFFEE_BROWN)
        .thumbnail(command.user.face())
        .description(format!(
            "Partage ce lien pour inviter des personnes sur le serveur !\n\n\
             **Ton lien :** https://discord.gg/{}\n\n\
             Chaque personne qui rejoint avec ton lien devient ton filleul. ✨",
            code
        ))
        .field(
            "📊 Tes Stats",
            format!(
                "**Filleuls validés :** {}\n**En attente de validation :** {}",
                stats.total_referrals,
                stats.pending.len()
            ),
            false,
        )
        .field(
            "✅ Conditions de Validation",
            "Un filleul est validé si :\n• Reste 7+ jours sur le serveur\n• Atteint le rang Robusta (niveau 2)",
            false,
        )
        .field(
            "🎁 Récompenses",
            "**1 filleul :** Rate limit bot x2 + Badge 🤝\n\
             **3 filleuls :** Pas de rate limit + Cooldown XP réduit\n\
             **5 filleuls :** +25% XP + Bypass modération\n\
             **10 filleuls :** +50% XP + Accès prioritaire bot",
            false,
        )
        .footer(CreateEmbedFooter::new("Le lien est permanent et illimité"))
        .timestamp(Timestamp::now());

    edit(ctx, command, EditInteractionResponse::new().embed(embed)).await
}

/// Handle the /filleuls command
pub async fn handle_filleuls_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
) -> Result<()> {
    let Some(guild_id) = require_guild(ctx, command).await? else {
        return Ok(());
    };
    command
        .defer_ephemeral(&ctx.http)
        .await
        .map_err(|e| miette::miette!("Failed to defer filleuls: {}", e))?;

    let stats = bot.referrals.stats(command.user.id.get());
    if stats.invite_code.is_none() {
        return edit(
            ctx,
            command,
            EditInteractionResponse::new().content(
                "❌ Tu n'as pas encore créé de lien de parrainage.\n\nUtilise `/parrainage` pour générer ton lien !",
            ),
        )
        .await;
    }

    let mut validated = Vec::new();
    for (i, referral) in stats.validated.iter().take(10).enumerate() {
        let name = match referral.user_id.parse::<u64>().ok().filter(|id| *id != 0) {
            Some(id) => UserId::new(id)
                .to_user(&ctx.http)
                .await
                .map(|u| u.tag())
                .unwrap_or_else(|_| "Utilisateur inconnu".to_string()),
            None => "Utilisateur inconnu".to_string(),
        };
        validated.push(format!(
            "**{}.** {} - <t:{}:R>",
            i + 1,
            name,
            referral.validated_at / 1000
        ));
    }
    if stats.validated.len() > 10 {
        validated.push(format!("_... et {} de plus_", stats.validated.len() - 10));
    }

    let now = chrono::Utc::now().timestamp_millis();
    let mut pending = Vec::new();
    for (i, referral) in stats.pending.iter().take(10).enumerate() {
        let Some(id) = referral.user_id.parse::<u64>().ok().filter(|id| *id != 0) else {
            continue;
        };
        let name = UserId::new(id)
            .to_user(&ctx.http)
            .await
            .map(|u| u.tag())
            .unwrap_or_else(|_| "Utilisateur inconnu".to_string());
        let days = (now - referral.joined_at).max(0) / (24 * 60 * 60 * 1000);
        let rank = rank_by_xp(bot.xp.get_user_xp(guild_id.get(), id).xp);
        let days_mark = if days >= 7 {
            "✅ 7j".to_string()
        } else {
            format!("⏳ {}/7j", days)
        };
        let rank_mark = if rank.level >= 2 {
            "✅ Robusta".to_string()
        } else {
            format!("⏳ {}", rank.name)
        };
        pending.push(format!("**{}.** {} - {} • {}", i + 1, name, days_mark, rank_mark));
    }

    let total = stats.total_referrals as usize;
    let embed = CreateEmbed::new()
        .title("🤝 Tes Filleuls")
        .colour(COFFEE_BROWN)
        .thumbnail(command.user.face())
        .field(
            format!("✅ Filleuls Validés ({})", stats.validated.len()),
            if validated.is_empty() {
                "Aucun filleul validé pour le moment".to_string()
            } else {
                validated.join("\n")
            },
            false,
        )
        .field(
            format!("⏳ En Attente ({})", stats.pending.len()),
            if pending.is_empty() {
                "Aucun filleul en attente".to_string()
            } else {
                pending.join("\n")
            },
            false,
        )
        .footer(CreateEmbedFooter::new(format!(
            "Total: {} filleul{} validé{}",
            total,
            plural(total),
            plural(total)
        )))
        .timestamp(Timestamp::now());

    edit(ctx, command, EditInteractionResponse::new().embed(embed)).await
}

/// Handle the /question command
pub async fn handle_question_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
    bot_id: Option<UserId>,
) -> Result<()> {
    let user_id = command.user.id.get();
    let question = find_option(&command.data.options, "question")
        .and_then(CommandDataOptionValue::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if question.is_empty() {
        return respond(ctx, command, "❓ Pose une question !").await;
    }
    if !bot.assistant.is_configured() {
        return respond(ctx, command, "❌ L'assistant IA n'est pas configuré.").await;
    }
    if let Some(left) = bot.cooldowns.bot_cooldown_remaining(user_id).await {
        return respond(
            ctx,
            command,
            format!("⏸️ Tu es en pause pour encore {} minute(s).", left.as_secs().div_ceil(60)),
        )
        .await;
    }

    let perks = bot.referrals.perks(user_id);
    let status = bot
        .cooldowns
        .check_rate_limit(user_id, perks.rate_limit_multiplier)
        .await;
    if !status.allowed {
        let wait = status.retry_after_label().unwrap_or_default();
        return respond(
            ctx,
            command,
            format!("⚠️ **Rate limit**: Tu peux utiliser cette commande dans {}", wait),
        )
        .await;
    }
    bot.cooldowns.record_request(user_id).await;

    command
        .defer(&ctx.http)
        .await
        .map_err(|e| miette::miette!("Failed to defer question: {}", e))?;

    let lines = match bot_id {
        Some(bot_id) => channel_history(&ctx.http, command.channel_id, bot.config.ai.history_messages, bot_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Could not fetch history for {}: {}", command.channel_id, e);
                Vec::new()
            }),
        None => Vec::new(),
    };
    tracing::info!("{} asking: {}", command.user.tag(), truncate_chars(&question, 100));

    match bot
        .assistant
        .answer(&question, &format_channel_history(&lines))
        .await
    {
        Ok(answer) => {
            let embed = CreateEmbed::new()
                .title("🤖 Réponse de l'Assistant")
                .description(truncate_utf16(&sanitize_mentions(&answer), 4000))
                .colour(COFFEE_BROWN)
                .field("❓ Question", truncate_utf16(&sanitize_mentions(&question), 1024), false)
                .footer(CreateEmbedFooter::new(format!("Demandé par {}", command.user.tag())))
                .timestamp(Timestamp::now());
            edit(ctx, command, EditInteractionResponse::new().embed(embed)).await
        }
        Err(e) => {
            tracing::error!("Question failed: {}", e);
            bot.cooldowns.undo_last_request(user_id).await;
            edit(
                ctx,
                command,
                EditInteractionResponse::new().content("❌ **Erreur**: Impossible de traiter la demande."),
            )
            .await
        }
    }
}

/// Handle the /discussion command
pub async fn handle_discussion_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
    bot_id: Option<UserId>,
) -> Result<()> {
    // Gated by MANAGE_MESSAGES at registration.
    command
        .defer_ephemeral(&ctx.http)
        .await
        .map_err(|e| miette::miette!("Failed to defer discussion: {}", e))?;

    let channel_id: ChannelId = command.channel_id;
    let (channel_name, topic) = match channel_id.to_channel(&ctx.http).await {
        Ok(channel) => match channel.guild() {
            Some(guild_channel) => (guild_channel.name, guild_channel.topic),
            None => (channel_id.to_string(), None),
        },
        Err(e) => {
            tracing::warn!("Could not resolve channel {}: {}", channel_id, e);
            (channel_id.to_string(), None)
        }
    };

    let previous = match bot_id {
        Some(bot_id) => match channel_id
            .messages(&ctx.http, GetMessages::new().limit(100))
            .await
        {
            Ok(messages) => scored_questions(&messages, bot_id),
            Err(e) => {
                tracing::warn!("Could not read earlier questions in {}: {}", channel_name, e);
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    tracing::info!("{} earlier questions found in {}", previous.len(), channel_name);

    let question = match bot
        .assistant
        .generate_discussion_question(&channel_name, topic.as_deref(), &previous)
        .await
    {
        Ok(question) => sanitize_mentions(&question),
        Err(e) => {
            tracing::error!("Failed to generate question: {}", e);
            return edit(
                ctx,
                command,
                EditInteractionResponse::new()
                    .content("❌ **Erreur critique:** Impossible de générer une question. Aucun message n'a été posté."),
            )
            .await;
        }
    };

    let embed = CreateEmbed::new()
        .title(DISCUSSION_TITLE)
        .description(&question)
        .colour(COFFEE_BROWN)
        .footer(CreateEmbedFooter::new("Partagez vos expériences DevOps et opinions!"))
        .timestamp(Timestamp::now());
    let posted = channel_id
        .send_message(&ctx.http, CreateMessage::new().embed(embed))
        .await
        .map_err(|e| miette::miette!("Failed to post discussion question: {}", e))?;
    for vote in [UPVOTE, DOWNVOTE] {
        if let Err(e) = posted
            .react(&ctx.http, ReactionType::Unicode(vote.to_string()))
            .await
        {
            tracing::warn!("Failed to seed {} reaction: {}", vote, e);
        }
    }

    edit(
        ctx,
        command,
        EditInteractionResponse::new().content(format!("✅ Question postée !\n\n**Question:** {}", question)),
    )
    .await
}

/// Handle the /keystore-stats command
pub async fn handle_keystore_stats_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
) -> Result<()> {
    if !require_owner(ctx, command, bot).await? {
        return Ok(());
    }

    let keystore = &bot.keystore;
    let stats = keystore.stats();
    let config = keystore.config();
    let budget = config.max_message_size.max(1);

    let mut embed = CreateEmbed::new()
        .title("📊 Statistiques du Keystore Discord")
        .colour(BLURPLE)
        .timestamp(Timestamp::now());

    embed = match config.channel_id.filter(|_| keystore.is_persistent()) {
        Some(channel) => embed.description(format!("Salon: <#{}>", channel)),
        None => embed.description("⚠️ Stockage en mémoire uniquement, rien n'est persisté."),
    };

    embed = embed.field(
        "📈 Résumé",
        format!(
            "**Stores actifs:** {}\n**Stores à synchroniser:** {}\n**Taille totale:** {} caractères\n\
             **Limite par message:** {} caractères\n**Sync automatique:** toutes les {} s",
            stats.total_stores,
            stats.dirty_stores,
            stats.total_size_bytes,
            budget,
            config.sync_interval_secs
        ),
        false,
    );

    let mut stores: Vec<(String, usize, usize, bool)> = keystore
        .store_names()
        .into_iter()
        .map(|name| {
            let size = keystore.get_store(&name).to_string().len();
            let messages = keystore.backing_message_ids(&name).len();
            let dirty = keystore.is_dirty(&name);
            (name, size, messages, dirty)
        })
        .collect();
    stores.sort_by(|a, b| b.1.cmp(&a.1));

    if !stores.is_empty() {
        let details = stores
            .iter()
            .take(8)
            .map(|(name, size, messages, dirty)| {
                let fill = (size * 100 / budget).min(100) as u8;
                format!(
                    "**{}**{}\n{} {} chars • {} message{}",
                    name,
                    if *dirty { " ✏️" } else { "" },
                    progress_bar(fill, 10),
                    size,
                    messages,
                    plural(*messages)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        embed = embed.field("💾 Stores", details, false);
    }

    let deletions = bot.deletions.stats();
    embed = embed.field(
        "🧹 Suppressions planifiées",
        format!(
            "**En attente:** {}\n**En retard:** {}",
            deletions.pending, deletions.overdue
        ),
        false,
    );

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embed)
                    .ephemeral(true),
            ),
        )
        .await
        .map_err(|e| miette::miette!("Failed to send keystore stats: {}", e))?;
    Ok(())
}

/// Handle the /remove-cooldown command
pub async fn handle_remove_cooldown_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
) -> Result<()> {
    if !require_owner(ctx, command, bot).await? {
        return Ok(());
    }
    let Some(target) = find_option(&command.data.options, "utilisateur")
        .and_then(CommandDataOptionValue::as_user_id)
    else {
        return respond(ctx, command, "❌ Utilisateur manquant.").await;
    };

    let content = match bot.cooldowns.remove_bot_cooldown(target.get()).await {
        Some(left) => {
            tracing::info!(
                "{} removed bot cooldown for {} ({}s remaining)",
                command.user.tag(),
                target,
                left.as_secs()
            );
            format!(
                "✅ **Cooldown retiré!**\n\n**Utilisateur:** <@{}>\n**Temps restant annulé:** {} minute(s)",
                target,
                left.as_secs().div_ceil(60)
            )
        }
        None => format!("ℹ️ <@{}> n'a pas de cooldown bot actif.", target),
    };
    respond(ctx, command, content).await
}

/// Handle the /manage-xp command
pub async fn handle_manage_xp_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
) -> Result<()> {
    if !require_owner(ctx, command, bot).await? {
        return Ok(());
    }
    let Some(guild_id) = require_guild(ctx, command).await? else {
        return Ok(());
    };
    let Some((subcommand, options)) = command.data.options.first().and_then(|o| match &o.value {
        CommandDataOptionValue::SubCommand(options) => Some((o.name.as_str(), options.as_slice())),
        _ => None,
    }) else {
        return respond(ctx, command, "❌ Sous-commande manquante.").await;
    };
    let Some(target) = find_option(options, "utilisateur").and_then(CommandDataOptionValue::as_user_id)
    else {
        return respond(ctx, command, "❌ Utilisateur manquant.").await;
    };
    let amount = find_option(options, "xp").and_then(CommandDataOptionValue::as_i64);

    command
        .defer_ephemeral(&ctx.http)
        .await
        .map_err(|e| miette::miette!("Failed to defer manage-xp: {}", e))?;

    let content = match (subcommand, amount) {
        ("view", _) => {
            let data = bot.xp.get_user_xp(guild_id.get(), target.get());
            let rank = rank_by_xp(data.xp);
            format!(
                "✅ **Statistiques de <@{}>**\n\n**Rang:** {}\n**XP Total:** {} XP\n**Messages:** {}\n**Level:** {}/{}",
                target,
                rank.name,
                data.xp,
                data.message_count,
                rank.level,
                RANKS.len()
            )
        }
        ("set", Some(xp)) => {
            let old_rank = rank_by_xp(bot.xp.get_user_xp(guild_id.get(), target.get()).xp);
            let updated = bot.xp.set_user_xp(guild_id.get(), target.get(), xp).await;
            let new_rank = rank_by_xp(updated.xp);
            let role_note = role_sync_note(ctx, guild_id, target, new_rank).await;
            tracing::info!("{} set {}'s XP to {}", command.user.tag(), target, updated.xp);
            let rank_line = if old_rank.level != new_rank.level {
                format!("{} → {}", old_rank.name, new_rank.name)
            } else {
                new_rank.name.to_string()
            };
            format!(
                "✅ XP de <@{}> défini à **{} XP**\n\n**Rang:** {}{}",
                target, updated.xp, rank_line, role_note
            )
        }
        ("add", Some(xp)) => {
            let gain = bot
                .xp
                .add_user_xp(guild_id.get(), target.get(), xp.max(0) as u64)
                .await;
            let role_note = if gain.leveled_up {
                role_sync_note(ctx, guild_id, target, gain.new_rank).await
            } else {
                String::new()
            };
            tracing::info!("{} added {} XP to {}", command.user.tag(), gain.xp_gained, target);
            let rank_line = if gain.leveled_up {
                format!("{} → {} 🎉", gain.old_rank.name, gain.new_rank.name)
            } else {
                gain.new_rank.name.to_string()
            };
            format!(
                "✅ **{} XP** ajouté à <@{}>\n\n**XP Total:** {} XP\n**Rang:** {}{}",
                gain.xp_gained, target, gain.total_xp, rank_line, role_note
            )
        }
        _ => "❌ Montant d'XP manquant.".to_string(),
    };

    edit(ctx, command, EditInteractionResponse::new().content(content)).await
}

/// Handle the /setup-ranks command
pub async fn handle_setup_ranks_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
) -> Result<()> {
    if !require_owner(ctx, command, bot).await? {
        return Ok(());
    }
    let Some(guild_id) = require_guild(ctx, command).await? else {
        return Ok(());
    };
    command
        .defer_ephemeral(&ctx.http)
        .await
        .map_err(|e| miette::miette!("Failed to defer setup-ranks: {}", e))?;

    let content = match create_rank_roles(&ctx.http, guild_id).await {
        Ok(created) if created.is_empty() => "✅ Tous les rôles de rang existent déjà.".to_string(),
        Ok(created) => {
            tracing::info!("{} created {} rank role(s)", command.user.tag(), created.len());
            format!(
                "✅ **{} rôle{} créé{}:**\n{}",
                created.len(),
                plural(created.len()),
                plural(created.len()),
                created.join("\n")
            )
        }
        Err(e) => {
            tracing::error!("Failed to create rank roles: {}", e);
            "❌ Impossible de créer les rôles. Vérifiez que le bot peut gérer les rôles.".to_string()
        }
    };
    edit(ctx, command, EditInteractionResponse::new().content(content)).await
}

/// Handle the /sync-ranks command
pub async fn handle_sync_ranks_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &BotContext,
) -> Result<()> {
    if !require_owner(ctx, command, bot).await? {
        return Ok(());
    }
    let Some(guild_id) = require_guild(ctx, command).await? else {
        return Ok(());
    };
    command
        .defer_ephemeral(&ctx.http)
        .await
        .map_err(|e| miette::miette!("Failed to defer sync-ranks: {}", e))?;

    let rank_of = |user_id: UserId| rank_by_xp(bot.xp.get_user_xp(guild_id.get(), user_id.get()).xp);
    let content = match sync_all_rank_roles(&ctx.http, guild_id, rank_of).await {
        Ok(summary) => format!(
            "✅ **Rôles de rang synchronisés**\n\n**Mis à jour:** {}\n**Inchangés:** {}\n**Échecs:** {}",
            summary.updated, summary.unchanged, summary.failed
        ),
        Err(e) => {
            tracing::error!("Failed to sync rank roles: {}", e);
            "❌ Impossible de lister les membres ou les rôles du serveur.".to_string()
        }
    };
    edit(ctx, command, EditInteractionResponse::new().content(content)).await
}

/// Swap rank roles, returning a note for the reply when it fails.
async fn role_sync_note(
    ctx: &Context,
    guild_id: GuildId,
    user_id: UserId,
    rank: &cafe_core::Rank,
) -> String {
    match sync_rank_role(&ctx.http, guild_id, user_id, rank).await {
        Ok(()) => String::new(),
        Err(e) => {
            tracing::warn!("Rank role update failed for {}: {}", user_id, e);
            "\n\n⚠️ Le rôle de rang n'a pas pu être mis à jour. Vérifiez que le bot peut gérer les rôles.".to_string()
        }
    }
}
