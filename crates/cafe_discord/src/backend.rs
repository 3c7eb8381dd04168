//! Discord implementations of the core transport traits.

use std::sync::Arc;

use async_trait::async_trait;
use cafe_core::error::BackendError;
use cafe_core::keystore::{ChannelInfo, MessageBackend, StoredMessage};
use cafe_core::ledger::{MemberDirectory, MemberInfo, RoleDirectory};
use serenity::all::{Channel, ChannelId, ChannelType, CreateMessage, GetMessages, GuildId, Http, MessageId, RoleId, UserId};

use crate::error::backend_error;

/// Snowflakes are never zero; serenity panics on one.
fn snowflake(id: u64) -> Result<u64, BackendError> {
    if id == 0 {
        Err(BackendError::NotFound(String::from("id 0")))
    } else {
        Ok(id)
    }
}

/// Keystore channel access over the Discord REST API.
#[derive(Clone)]
pub struct SerenityBackend {
    http: Arc<Http>,
    bot_id: u64,
}

impl SerenityBackend {
    pub fn new(http: Arc<Http>, bot_id: u64) -> Self {
        Self { http, bot_id }
    }
}

impl std::fmt::Debug for SerenityBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerenityBackend")
            .field("bot_id", &self.bot_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageBackend for SerenityBackend {
    fn self_id(&self) -> u64 {
        self.bot_id
    }

    async fn resolve_channel(&self, channel_id: u64) -> Result<ChannelInfo, BackendError> {
        let channel = ChannelId::new(snowflake(channel_id)?)
            .to_channel(&self.http)
            .await
            .map_err(backend_error)?;
        Ok(match channel {
            Channel::Guild(guild_channel) => ChannelInfo {
                id: channel_id,
                text_capable: matches!(
                    guild_channel.kind,
                    ChannelType::Text | ChannelType::News | ChannelType::PrivateThread | ChannelType::PublicThread
                ),
                name: guild_channel.name,
            },
            Channel::Private(private) => ChannelInfo {
                id: channel_id,
                name: private.recipient.name,
                text_capable: true,
            },
            _ => ChannelInfo {
                id: channel_id,
                name: String::from("unknown"),
                text_capable: false,
            },
        })
    }

    async fn fetch_recent_messages(
        &self,
        channel_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, BackendError> {
        let limit = limit.clamp(1, 100) as u8;
        let messages = ChannelId::new(snowflake(channel_id)?)
            .messages(&self.http, GetMessages::new().limit(limit))
            .await
            .map_err(backend_error)?;
        Ok(messages
            .into_iter()
            .map(|message| StoredMessage {
                id: message.id.get(),
                author_id: message.author.id.get(),
                created_at: message.timestamp.unix_timestamp() * 1000,
                content: message.content,
            })
            .collect())
    }

    async fn send_message(&self, channel_id: u64, content: &str) -> Result<u64, BackendError> {
        let message = ChannelId::new(snowflake(channel_id)?)
            .send_message(&self.http, CreateMessage::new().content(content))
            .await
            .map_err(backend_error)?;
        Ok(message.id.get())
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), BackendError> {
        match ChannelId::new(snowflake(channel_id)?)
            .delete_message(&self.http, MessageId::new(snowflake(message_id)?))
            .await
            .map_err(backend_error)
        {
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Member and role lookups for the ledgers.
#[derive(Clone)]
pub struct GuildDirectory {
    http: Arc<Http>,
}

impl GuildDirectory {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

impl std::fmt::Debug for GuildDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildDirectory").finish_non_exhaustive()
    }
}

#[async_trait]
impl MemberDirectory for GuildDirectory {
    async fn member(&self, guild_id: u64, user_id: u64) -> Result<Option<MemberInfo>, BackendError> {
        match GuildId::new(snowflake(guild_id)?)
            .member(&self.http, UserId::new(snowflake(user_id)?))
            .await
            .map_err(backend_error)
        {
            Ok(member) => Ok(Some(MemberInfo {
                user_id,
                display_name: member.display_name().to_string(),
            })),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RoleDirectory for GuildDirectory {
    async fn role_exists(&self, guild_id: u64, role_id: u64) -> Result<bool, BackendError> {
        let roles = GuildId::new(snowflake(guild_id)?)
            .roles(&self.http)
            .await
            .map_err(backend_error)?;
        Ok(role_id != 0 && roles.contains_key(&RoleId::new(role_id)))
    }
}
