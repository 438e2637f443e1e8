// src/api/mod.rs
// HTTP ingress: chat endpoint, health probes, metrics

pub mod chat;
pub mod health;

use axum::{
    Router,
    routing::{get, post},
};

use crate::observability;
use crate::state::AppHandle;

/// HTTP router for the reasoning service
pub fn router(handle: AppHandle) -> Router {
    Router::new()
        .route("/chat", post(chat::chat_handler))
        .route("/health", get(health::health))
        .route("/health/deep", get(health::health_deep))
        .route("/metrics", get(observability::metrics_handler))
        .with_state(handle)
}
