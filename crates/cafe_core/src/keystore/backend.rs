//! MessageBackend trait - the chat primitives the keystore is built on
//!
//! Abstracts over the transport (serenity HTTP in production, an in-memory
//! channel in tests).

use core::fmt;

use async_trait::async_trait;

use crate::error::BackendError;

/// A resolved channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: u64,
    pub name: String,
    /// Whether the channel accepts text messages.
    pub text_capable: bool,
}

/// A message as seen by the keystore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: u64,
    pub author_id: u64,
    pub content: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Channel message primitives consumed by the keystore.
#[async_trait]
pub trait MessageBackend: Send + Sync + fmt::Debug {
    /// User ID of the bot; only its own messages are treated as records.
    fn self_id(&self) -> u64;

    /// Look up a channel.
    async fn resolve_channel(&self, channel_id: u64) -> Result<ChannelInfo, BackendError>;

    /// Most recent messages first, at most `limit`.
    async fn fetch_recent_messages(
        &self,
        channel_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, BackendError>;

    /// Post a message and return its ID.
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<u64, BackendError>;

    /// Delete a message. Deleting a message that is already gone is `Ok`.
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), BackendError>;
}
