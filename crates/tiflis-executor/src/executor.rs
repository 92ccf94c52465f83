//! The reactive executor port.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::message::{ExecutorStep, Message};
use crate::tools::{Tool, ToolError};

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Executor failed: {0}")]
    Failed(String),
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental executor output.
pub type StepStream = BoxStream<'static, Result<ExecutorStep, ExecutorError>>;

/// A step-wise, tool-using language-model driver.
///
/// The engine only depends on this shape: given the full message list it
/// returns a stream of steps. Dropping the stream aborts the run.
#[async_trait]
pub trait ReactiveExecutor: Send + Sync {
    /// Start a run over `messages` with the given tool set.
    async fn invoke(
        &self,
        messages: Vec<Message>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<StepStream, ExecutorError>;
}
