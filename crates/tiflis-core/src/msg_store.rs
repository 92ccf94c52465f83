//! Accumulated per-session state for mirror clients.

use std::sync::{PoisonError, RwLock};

use crate::blocks::{self, ContentBlock};

#[derive(Default)]
struct Inner {
    blocks: Vec<ContentBlock>,
    is_streaming: bool,
}

/// Per-session block store.
///
/// Folds the blocks of the running turn with [`blocks::accumulate`] so a
/// late subscriber can be caught up from [`snapshot`](Self::snapshot)
/// instead of a replay.
#[derive(Default)]
pub struct BlockStore {
    inner: RwLock<Inner>,
}

impl BlockStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop accumulated state and mark the session as streaming.
    pub fn begin_turn(&self) {
        let mut inner = self.write();
        inner.blocks.clear();
        inner.is_streaming = true;
    }

    /// Fold streaming blocks into the accumulated state.
    pub fn push_blocks(&self, incoming: Vec<ContentBlock>) {
        let mut inner = self.write();
        blocks::accumulate(&mut inner.blocks, incoming);
        inner.is_streaming = true;
    }

    /// Replace the accumulated state with the merged result of the turn.
    pub fn complete(&self, merged: Vec<ContentBlock>) {
        let mut inner = self.write();
        inner.blocks = merged;
        inner.is_streaming = false;
    }

    /// Stop streaming without replacing state (cancelled or failed turn).
    pub fn halt(&self) {
        self.write().is_streaming = false;
    }

    /// Accumulated blocks and whether the turn is still streaming.
    #[must_use]
    pub fn snapshot(&self) -> (Vec<ContentBlock>, bool) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (inner.blocks.clone(), inner.is_streaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_late_subscriber_gets_accumulated_state() {
        let store = BlockStore::new();
        store.begin_turn();
        store.push_blocks(vec![ContentBlock::tool_running("calc", Some("u1".into()), None)]);
        store.push_blocks(vec![ContentBlock::text("Wor")]);
        store.push_blocks(vec![ContentBlock::text("Working")]);

        let (blocks, is_streaming) = store.snapshot();
        assert!(is_streaming);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].text_content(), Some("Working"));

        store.push_blocks(vec![ContentBlock::tool_result("calc", Some("u1".into()), "42", false)]);
        let (blocks, _) = store.snapshot();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].as_tool().is_some_and(|t| t.tool_output.as_deref() == Some("42")));

        store.halt();
        assert!(!store.snapshot().1);
    }

    #[test]
    fn test_complete_replaces_state() {
        let store = BlockStore::new();
        store.begin_turn();
        store.push_blocks(vec![ContentBlock::text("partial")]);
        store.complete(vec![ContentBlock::text("final")]);

        let (blocks, streaming) = store.snapshot();
        assert!(!streaming);
        assert_eq!(blocks[0].text_content(), Some("final"));

        store.begin_turn();
        assert!(store.snapshot().0.is_empty());
    }
}
