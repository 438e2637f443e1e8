// src/pipeline/mod.rs
// Bounded-retry reasoning state machine: retrieve context, generate, handle errors

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{Instrument, Span, field, info_span, warn};

use crate::error::PipelineError;
use crate::llm::{ChatMessage, ChatModel};
use crate::memory::{ConversationMemory, Role};
use crate::observability;

/// Failed attempts tolerated before the pipeline gives up
pub const MAX_RETRIES: u32 = 3;

/// Fixed reply produced when retries are exhausted
pub const APOLOGY: &str = "I'm unable to process your request at the moment \
     (retried 3 times). Please try again later.";

const FALLBACK_RESPONSE: &str = "No response generated.";

/// Ephemeral per-request state threaded through the machine.
///
/// Invariants: `error_count <= MAX_RETRIES`; `is_error` implies
/// `final_response` is set.
#[derive(Debug)]
pub struct PipelineState {
    pub messages: Vec<ChatMessage>,
    pub user_id: String,
    pub context: Option<Vec<String>>,
    pub final_response: Option<String>,
    pub error_count: u32,
    pub is_error: bool,
}

impl PipelineState {
    fn new(user_id: &str, text: &str) -> Self {
        Self {
            messages: vec![ChatMessage::user(text)],
            user_id: user_id.to_string(),
            context: None,
            final_response: None,
            error_count: 0,
            is_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    RetrieveContext,
    GenerateResponse,
    ErrorHandler,
}

// Routers are pure functions of state; None means terminal.

fn route_after_retrieve(state: &PipelineState) -> Node {
    if state.error_count > 0 {
        Node::ErrorHandler
    } else {
        Node::GenerateResponse
    }
}

fn route_after_generate(state: &PipelineState) -> Option<Node> {
    if state.final_response.is_some() {
        None
    } else {
        Some(Node::ErrorHandler)
    }
}

fn route_after_error(state: &PipelineState) -> Option<Node> {
    if state.error_count < MAX_RETRIES && state.final_response.is_none() {
        Some(Node::GenerateResponse)
    } else {
        None
    }
}

/// Invocation boundary between the transports and the state machine.
///
/// Every ingress consumes the pipeline through this trait, which lets the
/// transport tests script all three outcomes directly.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Run one request to a terminal state and return the reply.
    ///
    /// `Err(Graceful)` means retries were exhausted and the returned apology
    /// is the authoritative reply; `Err(Unhandled)` means the machine itself
    /// failed and the request does not count as processed.
    async fn invoke(&self, user_id: &str, text: &str) -> Result<String, PipelineError>;
}

/// The reasoning pipeline. Owns nothing durable; every invocation builds a
/// fresh `PipelineState` and walks the machine to a terminal state.
pub struct Pipeline {
    memory: Arc<dyn ConversationMemory>,
    llm: Arc<dyn ChatModel>,
    content_tracing: bool,
}

impl Pipeline {
    pub fn new(
        memory: Arc<dyn ConversationMemory>,
        llm: Arc<dyn ChatModel>,
        content_tracing: bool,
    ) -> Self {
        Self {
            memory,
            llm,
            content_tracing,
        }
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let mut node = Node::RetrieveContext;
        loop {
            let next = match node {
                Node::RetrieveContext => {
                    self.retrieve_context(state).await?;
                    Some(route_after_retrieve(state))
                }
                Node::GenerateResponse => {
                    self.generate_response(state).await;
                    route_after_generate(state)
                }
                Node::ErrorHandler => {
                    error_handler(state);
                    route_after_error(state)
                }
            };
            match next {
                Some(n) => node = n,
                None => return Ok(()),
            }
        }
    }

    /// Look up semantic context for the inbound message. Never fails: a
    /// search error degrades to empty context and burns one retry.
    async fn retrieve_context(&self, state: &mut PipelineState) -> Result<()> {
        let query = state
            .messages
            .last()
            .map(|m| m.content.clone())
            .context("pipeline state has no inbound message")?;

        match self.memory.search(&state.user_id, &query).await {
            Ok(hits) => {
                observability::record_context_size(hits.len());
                state.context = Some(hits);
            }
            Err(e) => {
                warn!(error = %e, "context retrieval failed");
                state.context = Some(Vec::new());
                state.error_count += 1;
            }
        }
        Ok(())
    }

    /// One generation attempt. On failure `final_response` stays unset and
    /// the router forwards to the error handler.
    async fn generate_response(&self, state: &mut PipelineState) {
        let context = state.context.as_deref().unwrap_or_default();
        let context_text = if context.is_empty() {
            "No prior context.".to_string()
        } else {
            context.join("\n")
        };

        let system = ChatMessage::system(format!(
            "You are Cogito, an analytical reasoning assistant. \
             Use the following conversation context to inform your reply.\n\n\
             Context:\n{context_text}"
        ));

        let mut prompt = Vec::with_capacity(state.messages.len() + 1);
        prompt.push(system);
        prompt.extend(state.messages.iter().cloned());

        match self.llm.chat(&prompt).await {
            Ok(text) => {
                state.messages.push(ChatMessage::assistant(text.clone()));
                state.final_response = Some(text);
                state.error_count = 0;
                state.is_error = false;
            }
            Err(e) => {
                warn!(error = %e, provider = self.llm.name(), "generation attempt failed");
            }
        }
    }

    async fn persist_turns(&self, user_id: &str, text: &str, response: &str) -> Result<()> {
        self.memory.save(user_id, Role::Human, text).await?;
        self.memory.save(user_id, Role::Ai, response).await?;
        Ok(())
    }
}

#[async_trait]
impl Reasoner for Pipeline {
    /// Run one request through the machine and persist both turns.
    async fn invoke(&self, user_id: &str, text: &str) -> Result<String, PipelineError> {
        let span = info_span!(
            "invoke_pipeline",
            user_id = %user_id,
            user_message = field::Empty,
            assistant_message = field::Empty,
        );
        observability::record_content(&span, "user_message", text, self.content_tracing);

        let content_tracing = self.content_tracing;
        async move {
            let mut state = PipelineState::new(user_id, text);
            self.run(&mut state).await.map_err(PipelineError::Unhandled)?;

            let response = state
                .final_response
                .clone()
                .unwrap_or_else(|| FALLBACK_RESPONSE.to_string());
            observability::record_content(
                &Span::current(),
                "assistant_message",
                &response,
                content_tracing,
            );

            // Best-effort persistence: the reply is authoritative, a storage
            // failure must not change the outcome seen by the caller.
            if let Err(e) = self.persist_turns(user_id, text, &response).await {
                warn!(error = %e, "memory save failed");
            }

            if state.is_error {
                return Err(PipelineError::Graceful(response));
            }
            Ok(response)
        }
        .instrument(span)
        .await
    }
}

/// Count the failed attempt; below the cap signal a retry, at the cap emit
/// the fixed apology and mark the state terminal-with-error.
fn error_handler(state: &mut PipelineState) {
    state.error_count += 1;
    if state.error_count < MAX_RETRIES {
        state.is_error = false;
        return;
    }
    state.messages.push(ChatMessage::assistant(APOLOGY));
    state.final_response = Some(APOLOGY.to_string());
    state.is_error = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyChatModel, RecordingMemory, StubChatModel};

    fn pipeline_with(memory: Arc<RecordingMemory>, llm: Arc<dyn ChatModel>) -> Pipeline {
        Pipeline::new(memory, llm, false)
    }

    #[tokio::test]
    async fn happy_path_returns_reply_and_saves_both_turns() {
        let memory = Arc::new(RecordingMemory::default());
        let pipeline = pipeline_with(memory.clone(), Arc::new(StubChatModel::new("hi")));

        let reply = pipeline.invoke("u1", "hello").await.unwrap();
        assert_eq!(reply, "hi");

        let saves = memory.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[0], ("u1".into(), "human".into(), "hello".into()));
        assert_eq!(saves[1], ("u1".into(), "ai".into(), "hi".into()));
    }

    /// Replies with the system prompt so tests can inspect prompt assembly
    struct EchoSystemModel;

    #[async_trait]
    impl ChatModel for EchoSystemModel {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
            Ok(messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn retrieved_context_lands_in_system_prompt() {
        let memory = Arc::new(RecordingMemory::with_context(vec![
            "the sky was discussed".into(),
            "user prefers short answers".into(),
        ]));
        let pipeline = pipeline_with(memory, Arc::new(EchoSystemModel));

        let reply = pipeline.invoke("u1", "hello").await.unwrap();
        assert!(reply.starts_with("You are Cogito"));
        assert!(reply.contains("the sky was discussed"));
        assert!(reply.contains("user prefers short answers"));
    }

    #[tokio::test]
    async fn empty_context_uses_placeholder() {
        let memory = Arc::new(RecordingMemory::default());
        let pipeline = pipeline_with(memory, Arc::new(EchoSystemModel));

        let reply = pipeline.invoke("u1", "hello").await.unwrap();
        assert!(reply.contains("No prior context."));
    }

    #[tokio::test]
    async fn exhausted_retries_return_graceful_apology() {
        let memory = Arc::new(RecordingMemory::default());
        let llm = Arc::new(FlakyChatModel::failing(MAX_RETRIES));
        let pipeline = pipeline_with(memory.clone(), llm.clone());

        let err = pipeline.invoke("u1", "hello").await.unwrap_err();
        match err {
            PipelineError::Graceful(text) => {
                assert!(text.contains("retried 3 times"));
            }
            other => panic!("expected graceful failure, got {other:?}"),
        }
        assert_eq!(llm.attempts(), 3);

        // Both turns are still persisted; the apology is the ai turn.
        let saves = memory.saves();
        assert_eq!(saves.len(), 2);
        assert!(saves[1].2.contains("retried 3 times"));
    }

    #[tokio::test]
    async fn two_failures_then_success_resets_error_count() {
        let memory = Arc::new(RecordingMemory::default());
        let llm = Arc::new(FlakyChatModel::new(2, "recovered"));
        let pipeline = pipeline_with(memory.clone(), llm.clone());

        let reply = pipeline.invoke("u1", "hello").await.unwrap();
        assert_eq!(reply, "recovered");
        assert_eq!(llm.attempts(), 3);

        // Final state had error_count reset by the successful generation:
        // observable as a normal (non-graceful) outcome.
        let mut state = PipelineState::new("u1", "hello");
        pipeline.run(&mut state).await.unwrap();
        assert_eq!(state.error_count, 0);
        assert!(!state.is_error);
    }

    #[tokio::test]
    async fn retrieval_failure_consumes_retry_budget() {
        let memory = Arc::new(RecordingMemory::failing_search());
        // The failed retrieval counts toward the retry budget twice (once in
        // the node, once in the error handler), leaving a single generation
        // attempt before the apology.
        let llm = Arc::new(FlakyChatModel::failing(1));
        let pipeline = pipeline_with(memory.clone(), llm.clone());

        let err = pipeline.invoke("u1", "hello").await.unwrap_err();
        assert!(matches!(err, PipelineError::Graceful(_)));
        assert_eq!(llm.attempts(), 1);
    }

    #[tokio::test]
    async fn retrieval_failure_still_allows_success() {
        let memory = Arc::new(RecordingMemory::failing_search());
        let pipeline = pipeline_with(memory.clone(), Arc::new(StubChatModel::new("hi")));

        let reply = pipeline.invoke("u1", "hello").await.unwrap();
        assert_eq!(reply, "hi");
    }

    #[tokio::test]
    async fn save_failure_is_swallowed() {
        let memory = Arc::new(RecordingMemory::failing_save());
        let pipeline = pipeline_with(memory.clone(), Arc::new(StubChatModel::new("hi")));

        let reply = pipeline.invoke("u1", "hello").await.unwrap();
        assert_eq!(reply, "hi");
    }

    #[tokio::test]
    async fn error_count_never_exceeds_cap() {
        let memory = Arc::new(RecordingMemory::failing_search());
        let llm = Arc::new(FlakyChatModel::failing(10));
        let pipeline = pipeline_with(memory, llm);

        let mut state = PipelineState::new("u1", "hello");
        pipeline.run(&mut state).await.unwrap();
        assert!(state.error_count <= MAX_RETRIES);
        assert!(state.final_response.is_some());
        assert!(state.is_error);
    }

    #[tokio::test]
    async fn terminal_state_always_has_response() {
        let memory = Arc::new(RecordingMemory::default());
        let llm = Arc::new(FlakyChatModel::failing(MAX_RETRIES));
        let pipeline = pipeline_with(memory, llm);

        let mut state = PipelineState::new("u1", "hello");
        pipeline.run(&mut state).await.unwrap();
        assert!(state.final_response.is_some());
    }

    #[test]
    fn routers_follow_state() {
        let mut state = PipelineState::new("u1", "hello");
        assert_eq!(route_after_retrieve(&state), Node::GenerateResponse);

        state.error_count = 1;
        assert_eq!(route_after_retrieve(&state), Node::ErrorHandler);
        assert_eq!(route_after_generate(&state), Some(Node::ErrorHandler));
        assert_eq!(route_after_error(&state), Some(Node::GenerateResponse));

        state.final_response = Some("done".into());
        assert_eq!(route_after_generate(&state), None);
        assert_eq!(route_after_error(&state), None);

        state.final_response = None;
        state.error_count = MAX_RETRIES;
        assert_eq!(route_after_error(&state), None);
    }

    #[test]
    fn error_handler_emits_apology_at_cap() {
        let mut state = PipelineState::new("u1", "hello");
        state.error_count = MAX_RETRIES - 1;
        error_handler(&mut state);
        assert!(state.is_error);
        assert_eq!(state.final_response.as_deref(), Some(APOLOGY));
        assert!(matches!(
            state.messages.last(),
            Some(m) if m.content == APOLOGY
        ));
    }
}
