// src/state.rs
// Application state shared across handlers

use anyhow::{Result, anyhow};
use std::sync::{Arc, OnceLock};

use crate::memory::ConversationMemory;
use crate::pipeline::Reasoner;
use crate::transport::TransportStatus;

/// Service singletons, created once during startup. No module-level mutation
/// after startup; ingresses and handlers receive a handle at construction.
pub struct AppState {
    pub memory: Arc<dyn ConversationMemory>,
    pub pipeline: Arc<dyn Reasoner>,
    pub ephemeral: Arc<dyn TransportStatus>,
    pub version: String,
}

/// Late-bound handle to the application state.
///
/// The HTTP router is built before the transports finish connecting; until
/// `install` runs, request handlers observe an empty handle and answer 503.
#[derive(Clone, Default)]
pub struct AppHandle {
    inner: Arc<OnceLock<Arc<AppState>>>,
}

impl AppHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the fully-constructed state. May only happen once.
    pub fn install(&self, state: Arc<AppState>) -> Result<()> {
        self.inner
            .set(state)
            .map_err(|_| anyhow!("application state already installed"))
    }

    pub fn get(&self) -> Option<Arc<AppState>> {
        self.inner.get().cloned()
    }
}
