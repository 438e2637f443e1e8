// src/api/health.rs
// Health check and readiness endpoints for load balancers and Kubernetes probes

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use crate::memory::ConversationMemory;
use crate::state::AppHandle;
use crate::transport::TransportStatus;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: String,
}

#[derive(Serialize)]
struct Components {
    vector: bool,
    sql: bool,
    ephemeral: bool,
}

#[derive(Serialize)]
struct DeepHealthResponse {
    status: &'static str,
    version: String,
    components: Components,
}

fn fallback_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// GET /health - shallow liveness probe. Always fast, never touches the
/// stores; reports whether the ephemeral transport is connected.
pub async fn health(State(handle): State<AppHandle>) -> impl IntoResponse {
    let (connected, version) = match handle.get() {
        Some(state) => (state.ephemeral.is_connected(), state.version.clone()),
        None => (false, fallback_version()),
    };

    if connected {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                version,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "starting",
                version,
            }),
        )
    }
}

/// GET /health/deep - readiness probe. Probes both stores and the ephemeral
/// transport; 200 only when every component is healthy.
pub async fn health_deep(State(handle): State<AppHandle>) -> impl IntoResponse {
    let Some(state) = handle.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(DeepHealthResponse {
                status: "not_ready",
                version: fallback_version(),
                components: Components {
                    vector: false,
                    sql: false,
                    ephemeral: false,
                },
            }),
        );
    };

    let stores = state.memory.health_check().await;
    let components = Components {
        vector: stores.vector,
        sql: stores.sql,
        ephemeral: state.ephemeral.is_connected(),
    };

    let all_healthy = components.vector && components.sql && components.ephemeral;
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(DeepHealthResponse {
            status: if all_healthy { "ok" } else { "degraded" },
            version: state.version.clone(),
            components,
        }),
    )
}
