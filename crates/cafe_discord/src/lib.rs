//! Café Discord - Discord Bot Integration
//!
//! This crate wires the Café Bot ledgers and keystore to Discord through
//! serenity: the gateway event handler, the slash commands, the background
//! jobs, and the REST-backed implementations of the core transport traits.
//!
//! ## Configuration
//!
//! The bot takes a fully loaded `cafe_core::BotConfig` through
//! [`BotContext::new`]. There are NO runtime environment variable reads in
//! this crate.

pub mod backend;
pub mod context;
pub mod discussion;
pub mod error;
pub mod handler;
pub mod invites;
pub mod jobs;
pub mod roles;
pub mod slash_commands;

pub use backend::{GuildDirectory, SerenityBackend};
pub use context::BotContext;
pub use error::{DiscordError, Result};
pub use handler::CafeHandler;

// Re-export serenity for convenience
pub use serenity;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{BotContext, CafeHandler, DiscordError, GuildDirectory, Result, SerenityBackend};
}
