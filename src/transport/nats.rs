// src/transport/nats.rs
// NATS request-reply subscriber for real-time reasoning requests

use anyhow::{Context, Result};
use async_nats::connection::State;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::TransportStatus;
use crate::config::NatsConfig;
use crate::observability;
use crate::pipeline::Reasoner;

const TRANSPORT: &str = "nats";

#[derive(Debug, Deserialize)]
struct EphemeralRequest {
    user_id: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct EphemeralReply {
    user_id: String,
    text: String,
    latency_ms: u64,
}

#[derive(Debug, Serialize)]
struct EphemeralErrorReply {
    error: String,
    latency_ms: u64,
}

/// Queue-group subscriber on the request subject.
///
/// Supports both request-reply (message carries a reply subject) and
/// fire-and-forget (no reply subject; the outcome is discarded). There is no
/// redelivery on this transport: every failure, graceful or not, surfaces to
/// the caller as an error reply.
pub struct NatsIngress {
    client: async_nats::Client,
    pipeline: Arc<dyn Reasoner>,
    subject: String,
    queue_group: String,
}

impl NatsIngress {
    pub async fn connect(config: &NatsConfig, pipeline: Arc<dyn Reasoner>) -> Result<Self> {
        let client = async_nats::connect(config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;
        info!(url = %config.url, "NATS connected");

        Ok(Self {
            client,
            pipeline,
            subject: config.subject.clone(),
            queue_group: config.queue_group.clone(),
        })
    }

    /// Subscribe and spawn the dispatch loop. Each message is handled on its
    /// own task so a slow inference does not stall receipt.
    pub async fn subscribe(&self) -> Result<JoinHandle<()>> {
        let mut subscriber = self
            .client
            .queue_subscribe(self.subject.clone(), self.queue_group.clone())
            .await
            .context("Failed to subscribe to request subject")?;
        info!(subject = %self.subject, queue_group = %self.queue_group, "NATS subscribed");

        let client = self.client.clone();
        let pipeline = self.pipeline.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let client = client.clone();
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    let reply =
                        process(pipeline.as_ref(), &message.payload, message.reply.is_some())
                            .await;
                    if let (Some(payload), Some(subject)) = (reply, message.reply) {
                        if let Err(e) = client.publish(subject, payload.into()).await {
                            warn!(error = %e, "reply publish failed");
                        }
                    }
                });
            }
        });
        Ok(handle)
    }

    /// Drain the subscription and connection
    pub async fn close(&self) {
        if let Err(e) = self.client.drain().await {
            warn!(error = %e, "NATS drain failed");
        }
    }
}

impl TransportStatus for NatsIngress {
    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }
}

/// Handle one inbound message; the returned bytes are the reply payload, or
/// `None` when the caller did not ask for one (fire-and-forget). Nothing
/// propagates out of here.
async fn process(pipeline: &dyn Reasoner, payload: &[u8], wants_reply: bool) -> Option<Vec<u8>> {
    let start = Instant::now();
    observability::record_request(TRANSPORT);

    let outcome = handle_request(pipeline, payload).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok((user_id, text)) => {
            observability::record_latency(TRANSPORT, latency_ms as f64);
            if !wants_reply {
                return None;
            }
            serde_json::to_vec(&EphemeralReply {
                user_id,
                text,
                latency_ms,
            })
            .ok()
        }
        Err(error) => {
            observability::record_error(TRANSPORT);
            if !wants_reply {
                return None;
            }
            serde_json::to_vec(&EphemeralErrorReply { error, latency_ms }).ok()
        }
    }
}

async fn handle_request(pipeline: &dyn Reasoner, payload: &[u8]) -> Result<(String, String), String> {
    let request: EphemeralRequest =
        serde_json::from_slice(payload).map_err(|e| format!("invalid request payload: {e}"))?;
    if request.user_id.is_empty() || request.text.is_empty() {
        return Err("user_id and text must not be empty".to_string());
    }

    match pipeline.invoke(&request.user_id, &request.text).await {
        Ok(text) => Ok((request.user_id, text)),
        // Both graceful and unhandled failures become error replies; this
        // transport never redelivers.
        Err(e) => Err(e.message()),
    }
}
