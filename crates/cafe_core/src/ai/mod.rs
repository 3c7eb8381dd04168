//! AI gateway
//!
//! The bot talks to a single chat-completion endpoint. Everything above it
//! (moderation, answers, discussion prompts) is plain prompt construction
//! over the [`CompletionProvider`] trait, so tests can script the model.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CompletionError;

pub mod assistant;
pub mod moderation;
pub mod openrouter;

pub use assistant::{format_channel_history, Assistant, HistoryLine, ScoredQuestion};
pub use moderation::{parse_decision, ModerationDecision, Moderator};
pub use openrouter::OpenRouterClient;

/// One system + user exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    /// Client-side deadline for the whole call.
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.7,
            max_tokens: 500,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
            timeout,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Same value for presence and frequency penalties.
    pub fn with_penalties(mut self, penalty: f32) -> Self {
        self.presence_penalty = Some(penalty);
        self.frequency_penalty = Some(penalty);
        self
    }
}

/// A text-completion service.
#[async_trait]
pub trait CompletionProvider: Send + Sync + Debug {
    /// The trimmed completion text. Never empty on success.
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError>;

    /// False when the provider has no credentials and every call would fail.
    fn is_configured(&self) -> bool {
        true
    }
}
