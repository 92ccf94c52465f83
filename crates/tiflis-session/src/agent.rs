//! Agent variants as configuration.
//!
//! An agent variant is a bundle of injected strategies: how to build the
//! system prompt, which tools to offer, where history lives, and what to do
//! once a turn completes.

use std::sync::Arc;

use async_trait::async_trait;
use tiflis_core::{ContentBlock, HistoryError, HistoryStore};
use tiflis_executor::{NoTools, ToolProvider};

/// Builds the system prompt for a session.
pub trait SystemPromptBuilder: Send + Sync {
    fn build(&self, session_id: &str) -> String;
}

/// A fixed prompt shared by every session.
#[derive(Debug, Clone)]
pub struct StaticPrompt(pub String);

impl SystemPromptBuilder for StaticPrompt {
    fn build(&self, _session_id: &str) -> String {
        self.0.clone()
    }
}

impl<F> SystemPromptBuilder for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn build(&self, session_id: &str) -> String {
        self(session_id)
    }
}

/// Creates the history store backing a session.
pub trait HistoryStoreFactory: Send + Sync {
    /// # Errors
    /// Returns error if the store cannot hold a session with this id.
    fn create(&self, session_id: &str) -> Result<Arc<dyn HistoryStore>, HistoryError>;
}

/// Side effects run after a turn completes normally.
///
/// Runs after history is persisted and before the completion block is
/// emitted. Cancelled and failed turns never reach it.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_execution_complete(
        &self,
        session_id: &str,
        store: &dyn HistoryStore,
        merged_blocks: &[ContentBlock],
        final_text: &str,
    ) -> Result<(), HistoryError>;
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone)]
pub struct NoopHook;

#[async_trait]
impl CompletionHook for NoopHook {
    async fn on_execution_complete(
        &self,
        _session_id: &str,
        _store: &dyn HistoryStore,
        _merged_blocks: &[ContentBlock],
        _final_text: &str,
    ) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// One agent variant.
#[derive(Clone)]
pub struct AgentProfile {
    /// Variant name, e.g. `supervisor` or `coder`.
    pub agent_type: String,
    pub system_prompt: Arc<dyn SystemPromptBuilder>,
    pub tools: Arc<dyn ToolProvider>,
    pub history: Arc<dyn HistoryStoreFactory>,
    pub completion_hook: Arc<dyn CompletionHook>,
}

impl AgentProfile {
    /// Profile with no tools and a no-op completion hook.
    pub fn new(
        agent_type: impl Into<String>,
        system_prompt: impl SystemPromptBuilder + 'static,
        history: impl HistoryStoreFactory + 'static,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            system_prompt: Arc::new(system_prompt),
            tools: Arc::new(NoTools),
            history: Arc::new(history),
            completion_hook: Arc::new(NoopHook),
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: impl ToolProvider + 'static) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    #[must_use]
    pub fn with_completion_hook(mut self, hook: impl CompletionHook + 'static) -> Self {
        self.completion_hook = Arc::new(hook);
        self
    }
}

impl std::fmt::Debug for AgentProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProfile")
            .field("agent_type", &self.agent_type)
            .finish_non_exhaustive()
    }
}
