//! File-backed history storage.
//!
//! Layout under the root directory:
//! ```text
//! <root>/<session_id>/history.json
//! <root>/<session_id>/state/<key>.json
//! ```
//! Writes go to a temporary file first and are renamed into place.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;
use tiflis_core::{ConversationEntry, HistoryError, HistoryStore};
use tokio::fs;

use crate::agent::HistoryStoreFactory;

/// Accept ids and keys that are a single `[A-Za-z0-9_.-]` path component.
///
/// Anything else is rejected rather than rewritten, so two ids never share
/// a directory.
fn path_component(raw: &str) -> Result<&str, HistoryError> {
    let valid = !matches!(raw, "" | "." | "..")
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(raw)
    } else {
        Err(HistoryError::InvalidKey(raw.to_string()))
    }
}

/// History for one session stored as JSON files.
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    dir: PathBuf,
}

impl FileHistoryStore {
    /// Store rooted at `root`, for `session_id`.
    ///
    /// # Errors
    /// Returns `InvalidKey` if `session_id` is not a plain path component.
    pub fn new(root: impl AsRef<Path>, session_id: &str) -> Result<Self, HistoryError> {
        Ok(Self {
            dir: root.as_ref().join(path_component(session_id)?),
        })
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join("history.json")
    }

    fn state_path(&self, key: &str) -> Result<PathBuf, HistoryError> {
        Ok(self.dir.join("state").join(format!("{}.json", path_component(key)?)))
    }

    async fn read_json(path: &Path) -> Result<Option<Value>, HistoryError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json(path: &Path, value: &Value) -> Result<(), HistoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn load_history(&self) -> Result<Vec<ConversationEntry>, HistoryError> {
        match Self::read_json(&self.history_path()).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_history(&self, entries: &[ConversationEntry]) -> Result<(), HistoryError> {
        Self::write_json(&self.history_path(), &serde_json::to_value(entries)?).await
    }

    async fn clear_history(&self) -> Result<(), HistoryError> {
        match fs::remove_file(self.history_path()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn load_additional_state(&self, key: &str) -> Result<Option<Value>, HistoryError> {
        Self::read_json(&self.state_path(key)?).await
    }

    async fn save_additional_state(&self, key: &str, value: Value) -> Result<(), HistoryError> {
        Self::write_json(&self.state_path(key)?, &value).await
    }
}

/// Creates file-backed stores under a common root.
#[derive(Debug, Clone)]
pub struct FileHistoryFactory {
    root: PathBuf,
}

impl FileHistoryFactory {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl HistoryStoreFactory for FileHistoryFactory {
    fn create(&self, session_id: &str) -> Result<Arc<dyn HistoryStore>, HistoryError> {
        Ok(Arc::new(FileHistoryStore::new(&self.root, session_id)?))
    }
}
