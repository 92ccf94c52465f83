//! History store implementations.

pub mod file;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::{FileHistoryFactory, FileHistoryStore};
pub use memory::{MemoryHistoryFactory, MemoryHistoryStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteHistoryFactory, SqliteHistoryStore};
