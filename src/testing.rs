// src/testing.rs
// Shared fakes for unit tests: scriptable chat models and a recording memory

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::PipelineError;
use crate::llm::{ChatMessage, ChatModel};
use crate::memory::{ConversationMemory, Role, StoreHealth};
use crate::pipeline::Reasoner;
use crate::transport::TransportStatus;

/// Transport status fake with fixed connectivity
pub struct StubTransport(pub bool);

impl TransportStatus for StubTransport {
    fn is_connected(&self) -> bool {
        self.0
    }
}

/// Scriptable invocation boundary: returns one fixed outcome
pub enum StubReasoner {
    Reply(String),
    Graceful(String),
    Unhandled(String),
}

impl StubReasoner {
    pub fn replying(text: &str) -> Self {
        Self::Reply(text.to_string())
    }

    pub fn graceful(text: &str) -> Self {
        Self::Graceful(text.to_string())
    }

    pub fn unhandled(message: &str) -> Self {
        Self::Unhandled(message.to_string())
    }
}

#[async_trait]
impl Reasoner for StubReasoner {
    async fn invoke(&self, _user_id: &str, _text: &str) -> Result<String, PipelineError> {
        match self {
            StubReasoner::Reply(text) => Ok(text.clone()),
            StubReasoner::Graceful(text) => Err(PipelineError::Graceful(text.clone())),
            StubReasoner::Unhandled(message) => {
                Err(PipelineError::Unhandled(anyhow!("{message}")))
            }
        }
    }
}

/// Chat model that always replies with a fixed string
pub struct StubChatModel {
    reply: String,
}

impl StubChatModel {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
        }
    }
}

#[async_trait]
impl ChatModel for StubChatModel {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        Ok(self.reply.clone())
    }
}

/// Chat model that fails its first `fail_count` calls, then replies
pub struct FlakyChatModel {
    fail_count: u32,
    attempts: AtomicU32,
    reply: String,
}

impl FlakyChatModel {
    pub fn new(fail_count: u32, reply: &str) -> Self {
        Self {
            fail_count,
            attempts: AtomicU32::new(0),
            reply: reply.to_string(),
        }
    }

    pub fn failing(fail_count: u32) -> Self {
        Self::new(fail_count, "late reply")
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for FlakyChatModel {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_count {
            return Err(anyhow!("model unavailable (attempt {})", attempt + 1));
        }
        Ok(self.reply.clone())
    }
}

/// Memory fake that records saves and serves a canned search result.
/// `failing_search` / `failing_save` flip the corresponding operation into
/// an error for failure-path tests.
#[derive(Default)]
pub struct RecordingMemory {
    pub search_results: Vec<String>,
    fail_search: bool,
    fail_save: bool,
    saves: Mutex<Vec<(String, String, String)>>,
}

impl RecordingMemory {
    pub fn with_context(results: Vec<String>) -> Self {
        Self {
            search_results: results,
            ..Default::default()
        }
    }

    pub fn failing_search() -> Self {
        Self {
            fail_search: true,
            ..Default::default()
        }
    }

    pub fn failing_save() -> Self {
        Self {
            fail_save: true,
            ..Default::default()
        }
    }

    pub fn saves(&self) -> Vec<(String, String, String)> {
        self.saves.lock().expect("saves lock").clone()
    }
}

#[async_trait]
impl ConversationMemory for RecordingMemory {
    async fn search(&self, _user_id: &str, _query: &str) -> Result<Vec<String>> {
        if self.fail_search {
            return Err(anyhow!("vector store unreachable"));
        }
        Ok(self.search_results.clone())
    }

    async fn save(&self, user_id: &str, role: Role, content: &str) -> Result<()> {
        if self.fail_save {
            return Err(anyhow!("sql store unreachable"));
        }
        self.saves.lock().expect("saves lock").push((
            user_id.to_string(),
            role.as_str().to_string(),
            content.to_string(),
        ));
        Ok(())
    }

    async fn health_check(&self) -> StoreHealth {
        StoreHealth {
            vector: !self.fail_search,
            sql: !self.fail_save,
        }
    }
}
