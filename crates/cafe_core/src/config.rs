//! Configuration for Café Bot
//!
//! Loaded from an optional TOML file, then overlaid with environment
//! variables. Every field has a default so an empty file is valid.
//!
//! # Environment Variables
//!
//! - `DISCORD_TOKEN` -> discord.token
//! - `DISCORD_GUILD_ID` -> discord.guild_id (slash commands registered per guild)
//! - `OWNER_IDS` (comma-separated) -> discord.owners
//! - `KEYSTORE_CHANNEL_ID` -> keystore.channel_id
//! - `KEYSTORE_SYNC_INTERVAL_SECS` -> keystore.sync_interval_secs
//! - `OPENROUTER_API_KEY` -> ai.api_key

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level bot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub discord: DiscordConfig,
    pub keystore: KeystoreConfig,
    pub ai: AiConfig,
    pub xp: XpConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Bot token. Usually supplied through `DISCORD_TOKEN` rather than the file.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Register slash commands on this guild only (instant) instead of globally.
    pub guild_id: Option<u64>,
    /// User IDs allowed to run admin commands.
    pub owners: Vec<String>,
    /// Where automatic moderation actions are reported.
    pub moderation_log_channel_id: Option<u64>,
}

impl DiscordConfig {
    pub fn is_owner(&self, user_id: u64) -> bool {
        let user_id = user_id.to_string();
        self.owners.iter().any(|o| o == &user_id)
    }
}

/// Keystore tuning. Defaults mirror Discord's limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreConfig {
    /// Channel whose messages hold the stores. `None` disables persistence.
    pub channel_id: Option<u64>,
    /// Periodic flush interval.
    pub sync_interval_secs: u64,
    /// Per-record size budget, under Discord's 2000 character ceiling.
    pub max_message_size: usize,
    /// How many recent messages are scanned on load and sync.
    pub history_limit: usize,
    /// Pause between consecutive sends/deletes.
    pub write_delay_ms: u64,
    /// Delay used by `Keystore::sync_soon`.
    pub flush_debounce_ms: u64,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            sync_interval_secs: 5 * 60,
            max_message_size: 1900,
            history_limit: 100,
            write_delay_ms: 100,
            flush_debounce_ms: 5_000,
        }
    }
}

impl KeystoreConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub moderation_timeout_secs: u64,
    pub answer_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    /// How many channel messages are handed to the model as context.
    pub history_messages: u8,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            model: "openai/gpt-4-turbo-preview".to_string(),
            moderation_timeout_secs: 10,
            answer_timeout_secs: 30,
            generation_timeout_secs: 60,
            history_messages: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XpConfig {
    /// Minimum delay between two XP-earning messages of the same user.
    pub cooldown_secs: u64,
    pub min_message_xp: u64,
    pub max_message_xp: u64,
    /// Channel for rank-up announcements; the message channel when unset.
    pub announce_channel_id: Option<u64>,
}

impl Default for XpConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            min_message_xp: 5,
            max_message_xp: 15,
            announce_channel_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub deletion_sweep_secs: u64,
    pub referral_validation_mins: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            deletion_sweep_secs: 60,
            referral_validation_mins: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// When set, logs are also written to a daily-rolling file here.
    pub directory: Option<PathBuf>,
    /// `EnvFilter` directive; `RUST_LOG` wins when present.
    pub filter: Option<String>,
}

impl BotConfig {
    /// Parse a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|cause| ConfigError::Io {
            path: path.display().to_string(),
            cause,
        })?;
        Self::from_toml_str(&raw).map_err(|cause| ConfigError::TomlParse {
            path: path.display().to_string(),
            cause,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup, so tests don't touch the
    /// process environment.
    pub fn apply_vars(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(token) = lookup("DISCORD_TOKEN") {
            self.discord.token = Some(token);
        }
        if let Some(guild) = lookup("DISCORD_GUILD_ID") {
            self.discord.guild_id = Some(parse_id("DISCORD_GUILD_ID", &guild)?);
        }
        if let Some(owners) = lookup("OWNER_IDS") {
            self.discord.owners = parse_comma_separated(&owners);
        }
        if let Some(channel) = lookup("KEYSTORE_CHANNEL_ID") {
            self.keystore.channel_id = Some(parse_id("KEYSTORE_CHANNEL_ID", &channel)?);
        }
        if let Some(secs) = lookup("KEYSTORE_SYNC_INTERVAL_SECS") {
            self.keystore.sync_interval_secs = parse_id("KEYSTORE_SYNC_INTERVAL_SECS", &secs)?;
        }
        if let Some(key) = lookup("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                self.ai.api_key = Some(key);
            }
        }
        Ok(())
    }

    /// Reject values that would make the bot misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keystore.max_message_size < 64 || self.keystore.max_message_size > 2000 {
            return Err(ConfigError::InvalidValue {
                field: "keystore.max_message_size".to_string(),
                reason: "must be between 64 and 2000".to_string(),
            });
        }
        if self.keystore.history_limit == 0 || self.keystore.history_limit > 100 {
            return Err(ConfigError::InvalidValue {
                field: "keystore.history_limit".to_string(),
                reason: "Discord returns at most 100 messages per fetch".to_string(),
            });
        }
        if self.keystore.sync_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "keystore.sync_interval_secs".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.xp.min_message_xp > self.xp.max_message_xp {
            return Err(ConfigError::InvalidValue {
                field: "xp.min_message_xp".to_string(),
                reason: "must not exceed xp.max_message_xp".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_id(field: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: format!("expected an unsigned integer, got {raw:?}"),
    })
}

/// Parse a comma-separated string into a Vec of trimmed, non-empty strings.
pub fn parse_comma_separated(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = BotConfig::from_toml_str("").unwrap();
        assert_eq!(config.keystore.max_message_size, 1900);
        assert_eq!(config.keystore.history_limit, 100);
        assert_eq!(config.keystore.sync_interval_secs, 300);
        assert!(config.keystore.channel_id.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = BotConfig::from_toml_str(
            r#"
            [keystore]
            channel_id = 42
            write_delay_ms = 0

            [xp]
            cooldown_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.keystore.channel_id, Some(42));
        assert_eq!(config.keystore.write_delay(), Duration::ZERO);
        assert_eq!(config.keystore.max_message_size, 1900);
        assert_eq!(config.xp.cooldown_secs, 30);
        assert_eq!(config.xp.max_message_xp, 15);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("DISCORD_TOKEN", "tok"),
            ("KEYSTORE_CHANNEL_ID", " 1234 "),
            ("OWNER_IDS", "1, 2,,3"),
            ("OPENROUTER_API_KEY", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = BotConfig::default();
        config
            .apply_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.discord.token.as_deref(), Some("tok"));
        assert_eq!(config.keystore.channel_id, Some(1234));
        assert_eq!(config.discord.owners, vec!["1", "2", "3"]);
        assert!(config.discord.is_owner(2));
        assert!(!config.discord.is_owner(4));
        // blank key is ignored
        assert!(config.ai.api_key.is_none());
    }

    #[test]
    fn test_env_overlay_rejects_bad_ids() {
        let mut config = BotConfig::default();
        let err = config
            .apply_vars(|k| (k == "KEYSTORE_CHANNEL_ID").then(|| "general".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validate_budget_bounds() {
        let mut config = BotConfig::default();
        config.keystore.max_message_size = 2500;
        assert!(config.validate().is_err());
        config.keystore.max_message_size = 1900;
        config.keystore.history_limit = 150;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cafe-bot.toml");
        std::fs::write(&path, "[discord]\nowners = [\"7\"]\n").unwrap();
        let config = BotConfig::load(&path).unwrap();
        assert!(config.discord.is_owner(7));

        let missing = BotConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }

    #[test]
    fn test_parse_comma_separated() {
        assert_eq!(parse_comma_separated("a, b , c"), vec!["a", "b", "c"]);
        assert!(parse_comma_separated(",,,").is_empty());
    }
}
