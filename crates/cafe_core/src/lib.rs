//! Café Core - Channel-backed Keystore and Community Ledgers
//!
//! This crate holds everything in Café Bot that does not speak Discord
//! directly: the keystore that persists named JSON stores as messages in a
//! private channel, the ledgers built on it (XP, referrals, AI cooldowns,
//! reaction roles, scheduled deletions), the rank table, and the gateway to
//! the completion API.

pub mod ai;
pub mod config;
pub mod error;
pub mod keystore;
pub mod ledger;
pub mod ranks;
pub mod sanitize;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ai::{Assistant, CompletionProvider, CompletionRequest, ModerationDecision, Moderator, OpenRouterClient};
pub use config::BotConfig;
pub use error::{BackendError, CompletionError, ConfigError, KeystoreError, Result};
pub use keystore::{ChannelInfo, Keystore, KeystoreStats, MessageBackend, StoredMessage, SyncReport};
pub use ranks::{Rank, RANKS};
