// src/main.rs
// Cogito reasoning service entry point

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use cogito::api;
use cogito::config::Config;
use cogito::embeddings::{Embedder, OllamaEmbedder};
use cogito::llm::{ChatModel, OllamaChat};
use cogito::memory::Memory;
use cogito::observability;
use cogito::pipeline::Pipeline;
use cogito::state::{AppHandle, AppState};
use cogito::transport::{DisabledTransport, NatsIngress, PulsarIngress, TransportStatus};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    observability::configure_logging();
    observability::init_metrics();

    let config = Config::from_env();
    info!(
        service = %config.service.name,
        version = %config.service.version,
        "starting"
    );

    // Memory: dual store plus encoder, shared by every ingress.
    let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(&config.embedding));
    let memory = Arc::new(Memory::connect(&config, embedder)?);
    memory.init().await;

    let llm: Arc<dyn ChatModel> = Arc::new(OllamaChat::new(&config.llm));
    let pipeline = Arc::new(Pipeline::new(memory.clone(), llm, config.content_tracing));

    // The router is built against an empty handle; /chat answers 503 until
    // the state is installed below.
    let handle = AppHandle::new();
    let router = api::router(handle.clone());

    let nats = if config.nats.enabled {
        let ingress = Arc::new(NatsIngress::connect(&config.nats, pipeline.clone()).await?);
        // The dispatch loop runs detached for the lifetime of the process.
        let _ = ingress.subscribe().await?;
        Some(ingress)
    } else {
        warn!("NATS transport disabled");
        None
    };

    let pulsar = if config.pulsar.enabled {
        Some(PulsarIngress::start(&config.pulsar, pipeline.clone()).await?)
    } else {
        None
    };

    let ephemeral: Arc<dyn TransportStatus> = match &nats {
        Some(ingress) => ingress.clone(),
        None => Arc::new(DisabledTransport),
    };
    handle.install(Arc::new(AppState {
        memory,
        pipeline,
        ephemeral,
        version: config.service.version.clone(),
    }))?;

    let addr = config.http.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    if let Some(ingress) = nats {
        ingress.close().await;
    }
    if let Some(ingress) = pulsar {
        ingress.close().await;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}
