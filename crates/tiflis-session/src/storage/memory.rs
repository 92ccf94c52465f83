//! In-memory history storage.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde_json::Value;
use tiflis_core::{ConversationEntry, HistoryError, HistoryStore};

use crate::agent::HistoryStoreFactory;

/// In-memory history for one session.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryHistoryStore {
    entries: RwLock<Vec<ConversationEntry>>,
    state: RwLock<HashMap<String, Value>>,
}

impl MemoryHistoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load_history(&self) -> Result<Vec<ConversationEntry>, HistoryError> {
        Ok(self
            .entries
            .read()
            .map_err(|e| HistoryError::Internal(e.to_string()))?
            .clone())
    }

    async fn save_history(&self, entries: &[ConversationEntry]) -> Result<(), HistoryError> {
        *self
            .entries
            .write()
            .map_err(|e| HistoryError::Internal(e.to_string()))? = entries.to_vec();
        Ok(())
    }

    async fn clear_history(&self) -> Result<(), HistoryError> {
        self.entries
            .write()
            .map_err(|e| HistoryError::Internal(e.to_string()))?
            .clear();
        Ok(())
    }

    async fn load_additional_state(&self, key: &str) -> Result<Option<Value>, HistoryError> {
        Ok(self
            .state
            .read()
            .map_err(|e| HistoryError::Internal(e.to_string()))?
            .get(key)
            .cloned())
    }

    async fn save_additional_state(&self, key: &str, value: Value) -> Result<(), HistoryError> {
        self.state
            .write()
            .map_err(|e| HistoryError::Internal(e.to_string()))?
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// Hands out one shared in-memory store per session id.
#[derive(Clone, Default)]
pub struct MemoryHistoryFactory {
    stores: Arc<RwLock<HashMap<String, Arc<MemoryHistoryStore>>>>,
}

impl MemoryHistoryFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStoreFactory for MemoryHistoryFactory {
    fn create(&self, session_id: &str) -> Result<Arc<dyn HistoryStore>, HistoryError> {
        let mut stores = self
            .stores
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let store = stores
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(MemoryHistoryStore::new()));
        Ok(Arc::clone(store) as Arc<dyn HistoryStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_history_roundtrip_and_clear() {
        let store = MemoryHistoryStore::new();
        assert_ok!(
            store
                .save_history(&[ConversationEntry::user("hi"), ConversationEntry::assistant("hello")])
                .await
        );
        assert_eq!(store.load_history().await.unwrap().len(), 2);

        assert_ok!(store.clear_history().await);
        assert!(store.load_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_factory_shares_store_per_session() {
        let factory = MemoryHistoryFactory::new();
        let a = factory.create("s1").unwrap();
        assert_ok!(a.save_additional_state("backlog", serde_json::json!(["task"])).await);

        let again = factory.create("s1").unwrap();
        assert_eq!(
            again.load_additional_state("backlog").await.unwrap(),
            Some(serde_json::json!(["task"]))
        );
        assert_eq!(factory.create("s2").unwrap().load_additional_state("backlog").await.unwrap(), None);
    }
}
