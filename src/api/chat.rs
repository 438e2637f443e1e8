// src/api/chat.rs
// Synchronous HTTP reasoning endpoint

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tracing::error;

use crate::error::PipelineError;
use crate::observability;
use crate::pipeline::Reasoner;
use crate::state::AppHandle;

const TRANSPORT: &str = "http";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub user_id: String,
    pub text: String,
    pub latency_ms: u64,
}

/// POST /chat
///
/// 422 on empty text, 503 before the application state is installed, 500 on
/// an unhandled pipeline failure. A graceful failure (retries exhausted) is
/// still a 200: the apology text is the reply.
pub async fn chat_handler(
    State(handle): State<AppHandle>,
    Json(body): Json<ChatRequest>,
) -> Response {
    let Some(state) = handle.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "service not ready"})),
        )
            .into_response();
    };

    if body.text.trim().is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "text must not be empty"})),
        )
            .into_response();
    }

    observability::record_request(TRANSPORT);
    let start = Instant::now();

    match state.pipeline.invoke(&body.user_id, &body.text).await {
        Ok(text) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            observability::record_latency(TRANSPORT, latency_ms as f64);
            (
                StatusCode::OK,
                Json(ChatResponse {
                    user_id: body.user_id,
                    text,
                    latency_ms,
                }),
            )
                .into_response()
        }
        Err(PipelineError::Graceful(text)) => {
            // Fully processed; the apology is the reply.
            observability::record_error(TRANSPORT);
            let latency_ms = start.elapsed().as_millis() as u64;
            observability::record_latency(TRANSPORT, latency_ms as f64);
            (
                StatusCode::OK,
                Json(ChatResponse {
                    user_id: body.user_id,
                    text,
                    latency_ms,
                }),
            )
                .into_response()
        }
        Err(PipelineError::Unhandled(e)) => {
            observability::record_error(TRANSPORT);
            error!(error = %e, "chat request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}
