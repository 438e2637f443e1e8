// src/transport/pulsar.rs
// Durable Pulsar consumer for long-horizon reasoning tasks

use anyhow::{Context, Result};
use futures::TryStreamExt;
use pulsar::consumer::Message;
use pulsar::message::proto::command_subscribe::SubType;
use pulsar::{
    Consumer, DeserializeMessage, Error as PulsarError, Payload, Producer, Pulsar,
    SerializeMessage, TokioExecutor, producer,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PulsarConfig;
use crate::error::PipelineError;
use crate::observability;
use crate::pipeline::Reasoner;

const TRANSPORT: &str = "pulsar";

/// Bounded receive wait so the consume loop notices shutdown promptly
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct DurableRequest {
    pub request_id: String,
    pub user_id: String,
    pub text: String,
}

impl DeserializeMessage for DurableRequest {
    type Output = Result<DurableRequest, serde_json::Error>;

    fn deserialize_message(payload: &Payload) -> Self::Output {
        serde_json::from_slice(&payload.data)
    }
}

struct ResultPayload(Value);

impl SerializeMessage for ResultPayload {
    fn serialize_message(input: Self) -> Result<producer::Message, PulsarError> {
        let payload =
            serde_json::to_vec(&input.0).map_err(|e| PulsarError::Custom(e.to_string()))?;
        Ok(producer::Message {
            payload,
            ..Default::default()
        })
    }
}

/// Terminal broker action for one message. Exactly one of these happens per
/// message; acknowledge only follows a successful result publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckKind {
    Ack,
    Nack,
}

struct Disposition {
    msg: Message<DurableRequest>,
    publish: Option<Value>,
    ack: AckKind,
}

/// Shared-subscription consumer with per-message ack/nack and result
/// publishing.
///
/// Two failure paths:
///   Path A - the pipeline exhausted its retries (graceful): an `error`
///   result is published and the message is acknowledged. Bad input was
///   fully processed; redelivery would not help.
///   Path B - malformed payload or an unhandled pipeline failure: nothing is
///   published and the message is negative-acknowledged so the broker
///   redelivers it, bounded by broker policy.
pub struct PulsarIngress {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PulsarIngress {
    /// Connect, subscribe, and start the background consume loop
    pub async fn start(config: &PulsarConfig, pipeline: Arc<dyn Reasoner>) -> Result<Self> {
        let client: Pulsar<TokioExecutor> = Pulsar::builder(config.url.as_str(), TokioExecutor)
            .build()
            .await
            .context("Failed to connect to Pulsar")?;

        let consumer: Consumer<DurableRequest, TokioExecutor> = client
            .consumer()
            .with_topic(config.request_topic.as_str())
            .with_subscription(config.subscription.as_str())
            .with_subscription_type(SubType::Shared)
            .build()
            .await
            .context("Failed to subscribe to request topic")?;

        let producer: Producer<TokioExecutor> = client
            .producer()
            .with_topic(config.result_topic.as_str())
            .build()
            .await
            .context("Failed to create result producer")?;

        info!(
            request_topic = %config.request_topic,
            result_topic = %config.result_topic,
            subscription = %config.subscription,
            "Pulsar subscribed"
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consume_loop(
            consumer,
            producer,
            pipeline,
            shutdown.clone(),
        ));

        Ok(Self { shutdown, task })
    }

    /// Stop the consume loop and wait for it to finish
    pub async fn close(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "durable consume task ended abnormally");
        }
    }
}

/// Receive loop. Each message is evaluated on its own task so a slow
/// inference never stalls receipt; the terminal broker calls (publish, ack,
/// nack) come back through a channel because the client wants exclusive
/// access for them.
async fn consume_loop(
    mut consumer: Consumer<DurableRequest, TokioExecutor>,
    mut producer: Producer<TokioExecutor>,
    pipeline: Arc<dyn Reasoner>,
    shutdown: CancellationToken,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Disposition>();

    loop {
        let disposition = tokio::select! {
            _ = shutdown.cancelled() => break,
            d = rx.recv() => d,
            received = tokio::time::timeout(RECEIVE_TIMEOUT, consumer.try_next()) => {
                match received {
                    // Idle window elapsed; go around and re-check shutdown.
                    Err(_) => continue,
                    Ok(Ok(Some(msg))) => {
                        let pipeline = pipeline.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let (publish, ack) =
                                evaluate(pipeline.as_ref(), msg.deserialize()).await;
                            let _ = tx.send(Disposition { msg, publish, ack });
                        });
                        continue;
                    }
                    Ok(Ok(None)) => {
                        warn!("durable request stream closed");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "durable receive failed");
                        continue;
                    }
                }
            }
        };

        let Some(d) = disposition else { break };
        settle(&mut consumer, &mut producer, d).await;
    }

    // Settle whatever the in-flight workers already finished; anything later
    // stays unacknowledged and the broker redelivers it.
    while let Ok(d) = rx.try_recv() {
        settle(&mut consumer, &mut producer, d).await;
    }
}

/// Publish the result (when there is one) and acknowledge, or
/// negative-acknowledge. A failed publish downgrades to nack: the result was
/// not delivered, so the message must come back.
async fn settle(
    consumer: &mut Consumer<DurableRequest, TokioExecutor>,
    producer: &mut Producer<TokioExecutor>,
    d: Disposition,
) {
    let mut ack = d.ack == AckKind::Ack;
    if ack {
        if let Some(body) = d.publish {
            // Wait for the broker receipt; an unconfirmed result must not
            // lead to an acknowledged request.
            let receipt = match producer.send_non_blocking(ResultPayload(body)).await {
                Ok(pending) => pending.await,
                Err(e) => Err(e),
            };
            if let Err(e) = receipt {
                warn!(error = %e, "result publish failed");
                observability::record_error(TRANSPORT);
                ack = false;
            }
        }
    }

    let settled = if ack {
        consumer.ack(&d.msg).await
    } else {
        consumer.nack(&d.msg).await
    };
    if let Err(e) = settled {
        warn!(error = %e, "message settlement failed");
    }
}

/// Decide the fate of one message: what to publish (if anything) and whether
/// to acknowledge. Pure with respect to the broker, so the unit tests drive
/// it directly.
pub(crate) async fn evaluate(
    pipeline: &dyn Reasoner,
    request: Result<DurableRequest, serde_json::Error>,
) -> (Option<Value>, AckKind) {
    let start = Instant::now();
    observability::record_request(TRANSPORT);

    let request = match request {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed durable request");
            observability::record_error(TRANSPORT);
            return (None, AckKind::Nack);
        }
    };
    if request.request_id.is_empty() || request.user_id.is_empty() || request.text.is_empty() {
        warn!("durable request with empty required field");
        observability::record_error(TRANSPORT);
        return (None, AckKind::Nack);
    }

    match pipeline.invoke(&request.user_id, &request.text).await {
        Ok(text) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            observability::record_latency(TRANSPORT, latency_ms as f64);
            (
                Some(json!({
                    "request_id": request.request_id,
                    "user_id": request.user_id,
                    "text": text,
                    "latency_ms": latency_ms,
                })),
                AckKind::Ack,
            )
        }
        Err(PipelineError::Graceful(apology)) => {
            // Path A: publish the error result and acknowledge.
            observability::record_error(TRANSPORT);
            let latency_ms = start.elapsed().as_millis() as u64;
            (
                Some(json!({
                    "request_id": request.request_id,
                    "error": apology,
                    "latency_ms": latency_ms,
                })),
                AckKind::Ack,
            )
        }
        Err(PipelineError::Unhandled(e)) => {
            // Path B: redeliver.
            warn!(error = %e, "durable request failed");
            observability::record_error(TRANSPORT);
            (None, AckKind::Nack)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{APOLOGY, MAX_RETRIES, Pipeline};
    use crate::testing::{FlakyChatModel, RecordingMemory, StubChatModel, StubReasoner};

    fn pipeline(llm: Arc<dyn crate::llm::ChatModel>) -> Pipeline {
        Pipeline::new(Arc::new(RecordingMemory::default()), llm, false)
    }

    fn decode(payload: &[u8]) -> Result<DurableRequest, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    #[tokio::test]
    async fn success_publishes_result_and_acks() {
        let pipeline = pipeline(Arc::new(StubChatModel::new("reply")));
        let inbound = br#"{"request_id": "r-1", "user_id": "u1", "text": "hi"}"#;

        let (publish, ack) = evaluate(&pipeline, decode(inbound)).await;
        assert_eq!(ack, AckKind::Ack);

        let result = publish.expect("result published");
        assert_eq!(result["request_id"], "r-1");
        assert_eq!(result["user_id"], "u1");
        assert_eq!(result["text"], "reply");
        assert!(result["latency_ms"].is_u64());
        assert!(result.get("error").is_none());
    }

    #[tokio::test]
    async fn graceful_failure_publishes_error_and_acks() {
        let pipeline = pipeline(Arc::new(FlakyChatModel::failing(MAX_RETRIES)));
        let inbound = br#"{"request_id": "r-2", "user_id": "u1", "text": "hi"}"#;

        let (publish, ack) = evaluate(&pipeline, decode(inbound)).await;
        assert_eq!(ack, AckKind::Ack);

        let result = publish.expect("error result published");
        assert_eq!(result["request_id"], "r-2");
        assert_eq!(result["error"], APOLOGY);
        // The error result is distinguishable by the absent text key.
        assert!(result.get("text").is_none());
    }

    #[tokio::test]
    async fn missing_request_id_nacks_without_publish() {
        let pipeline = pipeline(Arc::new(StubChatModel::new("reply")));
        let inbound = br#"{"user_id": "u1", "text": "hi"}"#;

        let (publish, ack) = evaluate(&pipeline, decode(inbound)).await;
        assert_eq!(ack, AckKind::Nack);
        assert!(publish.is_none());
    }

    #[tokio::test]
    async fn undecodable_payload_nacks_without_publish() {
        let pipeline = pipeline(Arc::new(StubChatModel::new("reply")));

        let (publish, ack) = evaluate(&pipeline, decode(b"not json")).await;
        assert_eq!(ack, AckKind::Nack);
        assert!(publish.is_none());
    }

    #[tokio::test]
    async fn empty_text_nacks_without_publish() {
        let pipeline = pipeline(Arc::new(StubChatModel::new("reply")));
        let inbound = br#"{"request_id": "r-3", "user_id": "u1", "text": ""}"#;

        let (publish, ack) = evaluate(&pipeline, decode(inbound)).await;
        assert_eq!(ack, AckKind::Nack);
        assert!(publish.is_none());
    }

    #[tokio::test]
    async fn unhandled_failure_nacks_without_publish() {
        let reasoner = StubReasoner::unhandled("state machine failed");
        let inbound = br#"{"request_id": "r-4", "user_id": "u1", "text": "hi"}"#;

        let (publish, ack) = evaluate(&reasoner, decode(inbound)).await;
        assert_eq!(ack, AckKind::Nack);
        assert!(publish.is_none());
    }
}
