//! Error types for cafe_core.

use miette::Diagnostic;
use thiserror::Error;

/// Result type for keystore operations.
pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Errors surfaced by a [`MessageBackend`](crate::keystore::MessageBackend).
#[derive(Debug, Error, Diagnostic)]
pub enum BackendError {
    /// The channel or message does not exist (or is no longer visible).
    #[error("Not found: {0}")]
    #[diagnostic(code(cafe_core::backend::not_found))]
    NotFound(String),

    /// The bot lacks permission for the operation.
    #[error("Forbidden: {0}")]
    #[diagnostic(
        code(cafe_core::backend::forbidden),
        help("Check the bot's permissions on the keystore channel")
    )]
    Forbidden(String),

    /// Any other transport failure.
    #[error("Backend request failed: {0}")]
    #[diagnostic(code(cafe_core::backend::request))]
    Request(String),
}

/// Errors that can occur in keystore operations.
#[derive(Debug, Error, Diagnostic)]
pub enum KeystoreError {
    /// No backing channel was configured.
    #[error("No keystore channel configured")]
    #[diagnostic(
        code(cafe_core::keystore::no_channel),
        help("Set KEYSTORE_CHANNEL_ID or keystore.channel_id")
    )]
    NoChannel,

    /// The backing channel could not be resolved.
    #[error("Keystore channel {channel_id} is unavailable")]
    #[diagnostic(
        code(cafe_core::keystore::channel_unavailable),
        help("Check KEYSTORE_CHANNEL_ID and that the bot can see the channel")
    )]
    ChannelUnavailable {
        channel_id: u64,
        #[source]
        cause: BackendError,
    },

    /// The backing channel exists but cannot hold messages.
    #[error("Channel {channel_id} ({name}) is not a text channel")]
    #[diagnostic(code(cafe_core::keystore::not_text_channel))]
    NotTextChannel { channel_id: u64, name: String },

    /// A single top-level entry does not fit one record even on its own.
    #[error("Entry {} of store \"{store}\" is too large: {size} > {budget} chars", key.as_deref().unwrap_or("<root>"))]
    #[diagnostic(
        code(cafe_core::keystore::entry_too_large),
        help("Split the entry into smaller top-level keys or prune the store")
    )]
    EntryTooLarge {
        store: String,
        key: Option<String>,
        size: usize,
        budget: usize,
    },

    /// Backend failure during a keystore operation.
    #[error("Backend error: {0}")]
    #[diagnostic(code(cafe_core::keystore::backend))]
    Backend(#[from] BackendError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(cafe_core::keystore::serde))]
    Serde(#[from] serde_json::Error),
}

/// Errors returned by a [`CompletionProvider`](crate::ai::CompletionProvider).
#[derive(Debug, Error, Diagnostic)]
pub enum CompletionError {
    /// No API key configured.
    #[error("Completion API key is not configured")]
    #[diagnostic(code(cafe_core::ai::not_configured), help("Set OPENROUTER_API_KEY"))]
    NotConfigured,

    /// The client-side deadline elapsed.
    #[error("Completion timed out after {}s", after.as_secs())]
    #[diagnostic(code(cafe_core::ai::timeout))]
    Timeout { after: std::time::Duration },

    /// The provider answered with a non-2xx status.
    #[error("Completion API returned HTTP {status}")]
    #[diagnostic(code(cafe_core::ai::http))]
    Http { status: u16, body: String },

    /// The request could not be sent or the body could not be read.
    #[error("Completion request failed: {0}")]
    #[diagnostic(code(cafe_core::ai::request))]
    Request(String),

    /// The provider answered but the completion was empty or malformed.
    #[error("Completion was empty or unparseable")]
    #[diagnostic(code(cafe_core::ai::empty))]
    Empty,
}

impl CompletionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CompletionError::Timeout { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("IO error reading {path}: {cause}")]
    #[diagnostic(code(cafe_core::config::io))]
    Io {
        path: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("TOML parse error in {path}: {cause}")]
    #[diagnostic(code(cafe_core::config::toml))]
    TomlParse {
        path: String,
        #[source]
        cause: toml::de::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(cafe_core::config::invalid_value))]
    InvalidValue { field: String, reason: String },
}
