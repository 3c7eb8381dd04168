//! Bot process lifecycle: authenticate, open the keystore, run the gateway
//! until Ctrl+C or SIGTERM, then flush.

use std::sync::Arc;

use cafe_core::ai::{CompletionProvider, OpenRouterClient};
use cafe_core::config::{BotConfig, KeystoreConfig};
use cafe_core::keystore::Keystore;
use cafe_discord::serenity::all::{GatewayIntents, Http};
use cafe_discord::serenity::Client;
use cafe_discord::{BotContext, CafeHandler, DiscordError, SerenityBackend};
use miette::Result;
use tracing::{info, warn};

pub fn intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_INVITES
}

/// Load the keystore from its channel, or fall back to memory when the
/// channel is missing or unusable.
async fn open_keystore(http: &Arc<Http>, bot_id: u64, config: &KeystoreConfig) -> Arc<Keystore> {
    if config.channel_id.is_none() {
        warn!("KEYSTORE_CHANNEL_ID not set, data will not survive a restart");
        return Arc::new(Keystore::detached(config.clone()));
    }

    let backend = Arc::new(SerenityBackend::new(Arc::clone(http), bot_id));
    let keystore = Arc::new(Keystore::new(backend, config.clone()));
    match keystore.initialize().await {
        Ok(()) => keystore,
        Err(e) => {
            warn!(
                "Keystore unavailable, continuing without persistence: {:?}",
                miette::Report::new(e)
            );
            Arc::new(Keystore::detached(config.clone()))
        }
    }
}

/// Resolves with the signal's name once the process is asked to stop.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "Ctrl+C",
        _ = terminate => "SIGTERM",
    }
}

pub async fn run(config: BotConfig) -> Result<()> {
    let token = config
        .discord
        .token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or(DiscordError::MissingToken)?;

    let http = Arc::new(Http::new(&token));
    let me = http
        .get_current_user()
        .await
        .map_err(|e| miette::miette!("Failed to authenticate with Discord: {}", e))?;
    info!("Authenticated as {} ({})", me.name, me.id);

    let keystore = open_keystore(&http, me.id.get(), &config.keystore).await;

    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenRouterClient::new(&config.ai));
    if !provider.is_configured() {
        warn!("OPENROUTER_API_KEY not set, AI answers are disabled");
    }

    let bot = Arc::new(BotContext::new(config, keystore, provider));
    let mut client = Client::builder(&token, intents())
        .event_handler(CafeHandler::new(Arc::clone(&bot)))
        .await
        .map_err(|e| miette::miette!("Failed to create Discord client: {}", e))?;
    let shard_manager = Arc::clone(&client.shard_manager);

    info!("Café Bot starting... Press Ctrl+C to stop.");
    tokio::select! {
        result = client.start() => {
            if let Err(e) = result {
                tracing::error!("Discord client error: {}", e);
            }
        }
        signal = shutdown_signal() => {
            info!("Received {}, shutting down", signal);
            shard_manager.shutdown_all().await;
        }
    }

    bot.shutdown().await;
    info!("Goodbye");
    Ok(())
}
