//! Core abstractions for streaming agent output.
//!
//! This crate provides the fundamental building blocks:
//! - `ContentBlock` - Typed unit of streamed output, with `accumulate`/`merge`
//! - `BlockStore` - Accumulated state for mirror clients
//! - `ConversationEntry` and the `HistoryStore` port

pub mod blocks;
pub mod msg_store;
pub mod traits;

pub use blocks::{BlockKind, ContentBlock, ToolBlock, ToolStatus, accumulate, merge};
pub use msg_store::BlockStore;
pub use traits::{ConversationEntry, HistoryError, HistoryStore, Role, SessionId};
