//! SQLite history storage (feature-gated).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use tiflis_core::{ConversationEntry, HistoryError, HistoryStore};

use crate::agent::HistoryStoreFactory;

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS conversation_history (
        session_id TEXT PRIMARY KEY,
        entries TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS session_state (
        session_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (session_id, key)
    )",
];

fn db_error(e: sqlx::Error) -> HistoryError {
    HistoryError::Internal(e.to_string())
}

/// Shared SQLite database holding the history of every session.
#[derive(Clone)]
pub struct SqliteHistoryFactory {
    pool: SqlitePool,
}

impl SqliteHistoryFactory {
    /// Connect and create the schema if needed.
    ///
    /// # Errors
    /// Returns error if database connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, HistoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(db_error)?;
        }
        Ok(Self { pool })
    }
}

impl HistoryStoreFactory for SqliteHistoryFactory {
    fn create(&self, session_id: &str) -> Result<Arc<dyn HistoryStore>, HistoryError> {
        Ok(Arc::new(SqliteHistoryStore {
            pool: self.pool.clone(),
            session_id: session_id.to_string(),
        }))
    }
}

/// SQLite-backed history for one session.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
    session_id: String,
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn load_history(&self) -> Result<Vec<ConversationEntry>, HistoryError> {
        let raw: Option<String> =
            sqlx::query_scalar::<_, String>("SELECT entries FROM conversation_history WHERE session_id = ?")
                .bind(&self.session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_history(&self, entries: &[ConversationEntry]) -> Result<(), HistoryError> {
        let raw = serde_json::to_string(entries)?;
        sqlx::query(
            "INSERT INTO conversation_history (session_id, entries, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET entries = excluded.entries,
                                                   updated_at = excluded.updated_at",
        )
        .bind(&self.session_id)
        .bind(raw)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn clear_history(&self) -> Result<(), HistoryError> {
        sqlx::query("DELETE FROM conversation_history WHERE session_id = ?")
            .bind(&self.session_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn load_additional_state(&self, key: &str) -> Result<Option<Value>, HistoryError> {
        let raw: Option<String> =
            sqlx::query_scalar::<_, String>("SELECT value FROM session_state WHERE session_id = ? AND key = ?")
                .bind(&self.session_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    async fn save_additional_state(&self, key: &str, value: Value) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT INTO session_state (session_id, key, value) VALUES (?, ?, ?)
             ON CONFLICT(session_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(&self.session_id)
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}
