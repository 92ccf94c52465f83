//! Agent sessions for tiflis.
//!
//! Provides:
//! - `AgentEngine` - Drive one session's turns, cancellation and history
//! - `AgentProfile` - Plug in prompts, tools, storage and completion hooks
//! - `SessionManager` - Own the engines of every live session
//! - Storage implementations (memory, file, SQLite)

pub mod agent;
pub mod engine;
pub mod manager;
pub mod storage;

pub use agent::{
    AgentProfile, CompletionHook, HistoryStoreFactory, NoopHook, StaticPrompt, SystemPromptBuilder,
};
pub use engine::{AgentEngine, AgentEvent, COMPLETION_STATUS, EngineConfig, EngineError, Phase};
pub use manager::{ManagerError, SessionInfo, SessionManager};
