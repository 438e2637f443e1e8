// src/memory/mod.rs
// Dual-store conversation memory: Qdrant (semantic search) + PostgreSQL (ordered history)

mod sql;
mod vector;

pub use self::sql::HistoryStore;
pub use self::vector::VectorStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::embeddings::Embedder;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
        }
    }
}

/// One utterance, persisted under the same id in both stores.
///
/// Turns are append-only: created after a successful generation, never
/// updated, never deleted by the service.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(user_id: &str, role: Role, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Per-store health, probed independently
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreHealth {
    pub vector: bool,
    pub sql: bool,
}

impl StoreHealth {
    pub fn all_healthy(&self) -> bool {
        self.vector && self.sql
    }
}

/// Memory operations as seen by the pipeline and the health endpoints.
///
/// The trait seam exists so tests can substitute recording fakes for the
/// real dual store.
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// Semantic recall: prior-turn snippets for this user, best match first
    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<String>>;

    /// Persist one turn to both stores
    async fn save(&self, user_id: &str, role: Role, content: &str) -> Result<()>;

    /// Probe both stores; one failure never masks the other
    async fn health_check(&self) -> StoreHealth;
}

/// Dual-store memory backed by Qdrant and PostgreSQL.
///
/// The two writes are not atomic. Upsert order is vector-first then SQL; a
/// crash between them can leave an unreferenced point in the vector store,
/// which callers accept (save failures are non-fatal to the reply).
pub struct Memory {
    vector: VectorStore,
    history: HistoryStore,
    embedder: Arc<dyn Embedder>,
    top_k: u64,
}

impl Memory {
    pub fn connect(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let vector = VectorStore::connect(&config.qdrant, embedder.dimensions())?;
        let history = HistoryStore::connect(&config.database)?;
        Ok(Self {
            vector,
            history,
            embedder,
            top_k: config.memory.context_top_k,
        })
    }

    /// Best-effort bootstrap: create the vector collection and the SQL schema
    /// if absent. Either side failing logs a warning and the service starts
    /// in degraded mode; /health/deep reports the actual store status.
    pub async fn init(&self) {
        if let Err(e) = self.vector.ensure_collection().await {
            warn!(error = %e, "vector store unavailable at init");
        }
        if let Err(e) = self.history.ensure_schema().await {
            warn!(error = %e, "sql store unavailable at init");
        }
    }
}

#[async_trait]
impl ConversationMemory for Memory {
    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<String>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query).await?;
        self.vector.search(user_id, vector, self.top_k).await
    }

    async fn save(&self, user_id: &str, role: Role, content: &str) -> Result<()> {
        let vector = self.embedder.embed(content).await?;
        let turn = ConversationTurn::new(user_id, role, content);

        // Vector first; the SQL row is what makes the turn visible to
        // ordered-history readers.
        self.vector.upsert(&turn, vector).await?;
        self.history.insert(&turn).await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreHealth {
        StoreHealth {
            vector: self.vector.probe().await,
            sql: self.history.probe().await,
        }
    }
}
