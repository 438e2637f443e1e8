// src/memory/sql.rs
// PostgreSQL-backed ordered conversation history

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::ConversationTurn;
use crate::config::DatabaseConfig;

const MAX_CONNECTIONS: u32 = 5;

/// Append-only history table, ordered by `created_at` rather than request
/// arrival. History for one user is looked up through the `user_id` index.
pub struct HistoryStore {
    pool: PgPool,
}

impl HistoryStore {
    /// Lazy pool: the service must come up even when the database is down,
    /// starting in degraded mode.
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_lazy(&config.url)
            .context("Invalid PostgreSQL connection URL")?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create conversations table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_user_id ON conversations (user_id)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create user_id index")?;

        Ok(())
    }

    pub async fn insert(&self, turn: &ConversationTurn) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversations (id, user_id, role, content, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(turn.id.to_string())
        .bind(&turn.user_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(turn.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert conversation turn")?;
        Ok(())
    }

    pub async fn probe(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
