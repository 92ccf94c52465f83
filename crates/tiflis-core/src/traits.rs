//! Conversation types and the history storage port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Session identifier.
pub type SessionId = String;

/// Speaker of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One persisted turn half.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationEntry {
    /// A user entry stamped with the current time.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    /// An assistant entry stamped with the current time.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Keep only the most recent `window` entries.
pub fn truncate_history(entries: &mut Vec<ConversationEntry>, window: usize) {
    if entries.len() > window {
        entries.drain(..entries.len() - window);
    }
}

/// History storage error.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable conversation history for one session.
///
/// The engine loads history at the start of each turn and saves it after a
/// turn completes. Keyed additional state is for agent-specific data that
/// must survive restarts (e.g. a task backlog).
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load the persisted history, oldest first.
    async fn load_history(&self) -> Result<Vec<ConversationEntry>, HistoryError>;

    /// Replace the persisted history.
    async fn save_history(&self, entries: &[ConversationEntry]) -> Result<(), HistoryError>;

    /// Remove all persisted history.
    async fn clear_history(&self) -> Result<(), HistoryError>;

    /// Load agent-specific state stored under `key`.
    async fn load_additional_state(&self, _key: &str) -> Result<Option<Value>, HistoryError> {
        Ok(None)
    }

    /// Store agent-specific state under `key`.
    async fn save_additional_state(&self, _key: &str, _value: Value) -> Result<(), HistoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_keeps_most_recent() {
        let mut entries: Vec<_> = (0..5).map(|i| ConversationEntry::user(i.to_string())).collect();
        truncate_history(&mut entries, 3);
        let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["2", "3", "4"]);

        truncate_history(&mut entries, 10);
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_entry_without_timestamp_parses() {
        let entry: ConversationEntry =
            serde_json::from_str(r#"{"role":"assistant","content":"hi"}"#).unwrap();
        assert_eq!(entry.role, Role::Assistant);
        assert!(entry.timestamp.is_none());
    }
}
