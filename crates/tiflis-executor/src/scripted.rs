//! Scripted executor for tests and demos.
//!
//! Replays a fixed sequence of steps, optionally paced and optionally ending
//! in a failure, while recording every invocation it receives.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::sleep;

use crate::executor::{ExecutorError, ReactiveExecutor, StepStream};
use crate::message::{ExecutorStep, Message, ToolCall};
use crate::tools::Tool;

/// Executor that replays a fixed script.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    steps: Vec<ExecutorStep>,
    step_delay: Option<Duration>,
    failure: Option<String>,
    invocations: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedExecutor {
    /// Create an executor replaying `steps`.
    #[must_use]
    pub fn new(steps: Vec<ExecutorStep>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Wait before each step.
    #[must_use]
    pub const fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Fail after the last step.
    #[must_use]
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Message lists received so far, one per invocation.
    #[must_use]
    pub fn invocations(&self) -> Vec<Vec<Message>> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReactiveExecutor for ScriptedExecutor {
    async fn invoke(
        &self,
        messages: Vec<Message>,
        _tools: Vec<Arc<dyn Tool>>,
    ) -> Result<StepStream, ExecutorError> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages);

        let steps = self.steps.clone();
        let delay = self.step_delay;
        let failure = self.failure.clone();

        let steps = stream! {
            for step in steps {
                if let Some(delay) = delay {
                    sleep(delay).await;
                }
                yield Ok(step);
            }
            if let Some(message) = failure {
                yield Err(ExecutorError::Failed(message));
            }
        };

        Ok(steps.boxed())
    }
}

/// Built-in scripts for common scenarios.
pub mod fixtures {
    use super::*;

    /// A single tool call followed by its result and a closing answer.
    #[must_use]
    pub fn tool_round_trip(use_id: &str, tool: &str, output: &str, answer: &str) -> Vec<ExecutorStep> {
        vec![
            ExecutorStep::new(vec![Message::assistant_with_tools(
                "",
                vec![ToolCall {
                    id: use_id.to_string(),
                    name: tool.to_string(),
                    args: serde_json::Value::Null,
                }],
            )]),
            ExecutorStep::new(vec![Message::tool_result(use_id, tool, output, false)]),
            ExecutorStep::new(vec![Message::assistant(answer)]),
        ]
    }

    /// Streaming text, resending the full accumulated text each step.
    #[must_use]
    pub fn streaming_text(chunks: &[&str]) -> Vec<ExecutorStep> {
        let mut text = String::new();
        chunks
            .iter()
            .map(|chunk| {
                text.push_str(chunk);
                ExecutorStep::new(vec![Message::assistant(text.clone())])
            })
            .collect()
    }
}
