// src/error.rs
// Pipeline outcome errors shared by every transport

use thiserror::Error;

/// Failure modes of a pipeline invocation.
///
/// The two variants carry the one bit the transports need: was the request
/// fully processed or not. `Graceful` means retries were exhausted and the
/// reply is a fixed apology; the message counts as processed (publish the
/// apology, acknowledge, do not redeliver). `Unhandled` means something
/// escaped the state machine; the message does not count as processed
/// (negative-acknowledge on durable transports, 5xx on HTTP).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Graceful(String),
    #[error("pipeline invocation failed: {0}")]
    Unhandled(#[from] anyhow::Error),
}

impl PipelineError {
    /// The text a caller should surface for this failure.
    pub fn message(&self) -> String {
        match self {
            PipelineError::Graceful(text) => text.clone(),
            PipelineError::Unhandled(err) => err.to_string(),
        }
    }
}
