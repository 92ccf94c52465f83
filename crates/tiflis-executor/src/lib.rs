//! Reactive executor port for agent turns.
//!
//! Provides:
//! - Executor message vocabulary and steps
//! - `ReactiveExecutor` and `ToolProvider` traits
//! - Step to `ContentBlock` parsing
//! - `ScriptedExecutor` for tests and demos

pub mod executor;
pub mod message;
pub mod parse;
pub mod scripted;
pub mod tools;

pub use executor::{ExecutorError, ReactiveExecutor, StepStream};
pub use message::{ExecutorStep, Message, ToolCall};
pub use parse::{parse_message, parse_step};
pub use scripted::ScriptedExecutor;
pub use tools::{NoTools, StaticTools, Tool, ToolError, ToolProvider, ToolSpec};
