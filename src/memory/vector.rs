// src/memory/vector.rs
// Qdrant-backed semantic store for conversation turns

use anyhow::{Context, Result};
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, Filter, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use std::collections::HashMap;
use tracing::{debug, info};

use super::ConversationTurn;
use crate::config::QdrantConfig;

/// Single-collection Qdrant store. Points are keyed by turn id and carry a
/// `{user_id, role, content}` payload; searches are filtered to one user.
pub struct VectorStore {
    client: Qdrant,
    collection: String,
    dimensions: u64,
}

impl VectorStore {
    pub fn connect(config: &QdrantConfig, dimensions: u64) -> Result<Self> {
        // Skip compatibility check to allow minor version mismatches
        let client = Qdrant::from_url(&config.url)
            .skip_compatibility_check()
            .build()
            .context("Failed to connect to Qdrant")?;

        Ok(Self {
            client,
            collection: config.collection.clone(),
            dimensions,
        })
    }

    /// Create the collection if absent. Safe to call repeatedly; a create
    /// race with another replica is tolerated.
    pub async fn ensure_collection(&self) -> Result<()> {
        let exists = self.client.collection_exists(&self.collection).await?;
        if exists {
            return Ok(());
        }

        info!("Creating Qdrant collection: {}", self.collection);
        match self
            .client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(self.dimensions, Distance::Cosine),
                ),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => {
                debug!(
                    "Collection {} already exists (created by another process)",
                    self.collection
                );
                Ok(())
            }
            Err(e) => {
                Err(e).context(format!("Failed to create collection: {}", self.collection))
            }
        }
    }

    pub async fn upsert(&self, turn: &ConversationTurn, vector: Vec<f32>) -> Result<()> {
        let mut payload: HashMap<String, QdrantValue> = HashMap::new();
        payload.insert("user_id".to_string(), turn.user_id.clone().into());
        payload.insert("role".to_string(), turn.role.as_str().into());
        payload.insert("content".to_string(), turn.content.clone().into());

        let point = PointStruct::new(turn.id.to_string(), vector, payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .context("Failed to upsert point to Qdrant")?;

        debug!(
            "Saved turn to Qdrant collection {} with id {}",
            self.collection, turn.id
        );
        Ok(())
    }

    /// Top-k payload contents for this user, in score order
    pub async fn search(&self, user_id: &str, vector: Vec<f32>, limit: u64) -> Result<Vec<String>> {
        let filter = Filter::must([Condition::matches("user_id", user_id.to_string())]);

        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector, limit)
                    .filter(filter)
                    .with_payload(true),
            )
            .await
            .context("Failed to search Qdrant")?;

        let hits = results
            .result
            .into_iter()
            .filter_map(|point| {
                point
                    .payload
                    .get("content")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
            .collect();

        Ok(hits)
    }

    pub async fn probe(&self) -> bool {
        self.client.health_check().await.is_ok()
    }
}
