//! In-memory test doubles.
//!
//! `MemoryChannel` is a [`MessageBackend`] over a shared message list, so
//! several keystores (several "bot instances") can be pointed at the same
//! channel in one test. `ScriptedProvider` stands in for the completion API.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::ai::{CompletionProvider, CompletionRequest};
use crate::error::{BackendError, CompletionError};
use crate::keystore::backend::{ChannelInfo, MessageBackend, StoredMessage};
use crate::keystore::codec::{self, ChunkRecord};

#[derive(Debug)]
struct ChannelState {
    /// Oldest first.
    messages: Vec<StoredMessage>,
    next_id: u64,
    clock_ms: i64,
    sends: usize,
    deletes: usize,
    fail_sends: bool,
    fail_deletes: bool,
    text_capable: bool,
}

/// A single shared channel. Clones share the same history.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    self_id: u64,
    channel_id: u64,
    state: Arc<Mutex<ChannelState>>,
}

impl MemoryChannel {
    pub fn new(self_id: u64, channel_id: u64) -> Self {
        Self {
            self_id,
            channel_id,
            state: Arc::new(Mutex::new(ChannelState {
                messages: Vec::new(),
                next_id: 1_000,
                clock_ms: 1_700_000_000_000,
                sends: 0,
                deletes: 0,
                fail_sends: false,
                fail_deletes: false,
                text_capable: true,
            })),
        }
    }

    /// Another client on the same channel, posting as `self_id`.
    pub fn as_user(&self, self_id: u64) -> Self {
        Self {
            self_id,
            channel_id: self.channel_id,
            state: Arc::clone(&self.state),
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Post a message as an arbitrary author, bypassing failure switches.
    pub fn inject(&self, author_id: u64, content: &str) -> u64 {
        let mut state = self.state.lock();
        push_message(&mut state, author_id, content)
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.state.lock().messages.clone()
    }

    /// Parsed records authored by this client, oldest first.
    pub fn records(&self) -> Vec<ChunkRecord> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.author_id == self.self_id)
            .filter_map(|m| codec::parse_record(&m.content))
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.state.lock().sends
    }

    pub fn delete_count(&self) -> usize {
        self.state.lock().deletes
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().fail_deletes = fail;
    }

    pub fn set_text_capable(&self, text_capable: bool) {
        self.state.lock().text_capable = text_capable;
    }

    fn check_channel(&self, channel_id: u64) -> Result<(), BackendError> {
        if channel_id == self.channel_id {
            Ok(())
        } else {
            Err(BackendError::NotFound(format!("channel {channel_id}")))
        }
    }
}

fn push_message(state: &mut ChannelState, author_id: u64, content: &str) -> u64 {
    let id = state.next_id;
    state.next_id += 1;
    state.clock_ms += 1;
    let created_at = state.clock_ms;
    state.messages.push(StoredMessage {
        id,
        author_id,
        content: content.to_string(),
        created_at,
    });
    id
}

#[async_trait]
impl MessageBackend for MemoryChannel {
    fn self_id(&self) -> u64 {
        self.self_id
    }

    async fn resolve_channel(&self, channel_id: u64) -> Result<ChannelInfo, BackendError> {
        self.check_channel(channel_id)?;
        Ok(ChannelInfo {
            id: channel_id,
            name: "keystore".to_string(),
            text_capable: self.state.lock().text_capable,
        })
    }

    async fn fetch_recent_messages(
        &self,
        channel_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, BackendError> {
        self.check_channel(channel_id)?;
        let state = self.state.lock();
        Ok(state.messages.iter().rev().take(limit).cloned().collect())
    }

    async fn send_message(&self, channel_id: u64, content: &str) -> Result<u64, BackendError> {
        self.check_channel(channel_id)?;
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(BackendError::Request("send rejected".to_string()));
        }
        state.sends += 1;
        Ok(push_message(&mut state, self.self_id, content))
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), BackendError> {
        self.check_channel(channel_id)?;
        let mut state = self.state.lock();
        if state.fail_deletes {
            return Err(BackendError::Forbidden("missing Manage Messages".to_string()));
        }
        let before = state.messages.len();
        state.messages.retain(|m| m.id != message_id);
        if state.messages.len() < before {
            state.deletes += 1;
        }
        Ok(())
    }
}

/// A [`CompletionProvider`] that replays queued results and records every
/// request it receives. Runs dry with [`CompletionError::Empty`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    replies: Arc<Mutex<VecDeque<Result<String, CompletionError>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    unconfigured: bool,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that behaves as if no API key were set.
    pub fn unconfigured() -> Self {
        Self {
            unconfigured: true,
            ..Self::default()
        }
    }

    pub fn reply(&self, text: &str) -> &Self {
        self.replies.lock().push_back(Ok(text.to_string()));
        self
    }

    pub fn fail(&self, error: CompletionError) -> &Self {
        self.replies.lock().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        if self.unconfigured {
            return Err(CompletionError::NotConfigured);
        }
        self.requests.lock().push(request);
        self.replies
            .lock()
            .pop_front()
            .unwrap_or(Err(CompletionError::Empty))
    }

    fn is_configured(&self) -> bool {
        !self.unconfigured
    }
}
