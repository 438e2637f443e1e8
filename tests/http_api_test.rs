// tests/http_api_test.rs
// End-to-end HTTP flow over the real pipeline with scripted collaborators

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use cogito::api;
use cogito::llm::{ChatMessage, ChatModel};
use cogito::memory::{ConversationMemory, Role, StoreHealth};
use cogito::pipeline::Pipeline;
use cogito::state::{AppHandle, AppState};
use cogito::transport::TransportStatus;

struct ScriptedModel {
    reply: Option<String>,
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        match &self.reply {
            Some(text) => Ok(text.clone()),
            None => Err(anyhow!("model offline")),
        }
    }
}

#[derive(Default)]
struct InMemoryStore {
    saves: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl ConversationMemory for InMemoryStore {
    async fn search(&self, _user_id: &str, _query: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn save(&self, user_id: &str, role: Role, content: &str) -> Result<()> {
        self.saves.lock().unwrap().push((
            user_id.to_string(),
            role.as_str().to_string(),
            content.to_string(),
        ));
        Ok(())
    }

    async fn health_check(&self) -> StoreHealth {
        StoreHealth {
            vector: true,
            sql: true,
        }
    }
}

struct ConnectedTransport;

impl TransportStatus for ConnectedTransport {
    fn is_connected(&self) -> bool {
        true
    }
}

fn app_with_model(reply: Option<&str>) -> (Router, Arc<InMemoryStore>) {
    let memory = Arc::new(InMemoryStore::default());
    let model = Arc::new(ScriptedModel {
        reply: reply.map(str::to_string),
    });
    let pipeline = Arc::new(Pipeline::new(memory.clone(), model, false));

    let handle = AppHandle::new();
    handle
        .install(Arc::new(AppState {
            memory: memory.clone(),
            pipeline,
            ephemeral: Arc::new(ConnectedTransport),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
        .unwrap();

    (api::router(handle), memory)
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn happy_chat_round_trip_persists_both_turns() {
    let (app, memory) = app_with_model(Some("hi"));

    let response = app
        .oneshot(chat_request(json!({"user_id": "u1", "text": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["text"], "hi");
    assert!(body["latency_ms"].is_u64());

    let saves = memory.saves.lock().unwrap().clone();
    assert_eq!(saves.len(), 2);
    assert_eq!(saves[0], ("u1".into(), "human".into(), "hello".into()));
    assert_eq!(saves[1], ("u1".into(), "ai".into(), "hi".into()));
}

#[tokio::test]
async fn exhausted_retries_surface_apology_with_200() {
    let (app, memory) = app_with_model(None);

    let response = app
        .oneshot(chat_request(json!({"user_id": "u1", "text": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let text = body["text"].as_str().unwrap();
    assert!(text.contains("retried 3 times"));

    // The apology is persisted as the ai turn.
    let saves = memory.saves.lock().unwrap().clone();
    assert_eq!(saves.len(), 2);
    assert_eq!(saves[1].1, "ai");
    assert!(saves[1].2.contains("retried 3 times"));
}

#[tokio::test]
async fn missing_text_key_is_unprocessable() {
    let (app, _memory) = app_with_model(Some("hi"));

    let response = app
        .oneshot(chat_request(json!({"user_id": "u1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
