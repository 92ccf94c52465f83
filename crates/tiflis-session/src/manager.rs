//! Session manager for orchestrating agent sessions.

use std::{collections::HashMap, sync::Arc};

use tiflis_core::SessionId;
use tiflis_executor::ReactiveExecutor;
use tokio::{
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    agent::AgentProfile,
    engine::{AgentEngine, AgentEvent, EngineConfig, EngineError, Phase},
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),
    #[error("Session already running")]
    AlreadyRunning,
}

/// Summary of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub agent_type: String,
    pub is_executing: bool,
}

/// Owns one engine per session and serializes turn starts.
pub struct SessionManager {
    executor: Arc<dyn ReactiveExecutor>,
    config: EngineConfig,
    profiles: HashMap<String, AgentProfile>,
    sessions: RwLock<HashMap<SessionId, Arc<AgentEngine>>>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl SessionManager {
    /// Create a manager. Engine events from every session go to `events`.
    #[must_use]
    pub fn new(
        executor: Arc<dyn ReactiveExecutor>,
        config: EngineConfig,
        profiles: impl IntoIterator<Item = AgentProfile>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            executor,
            config,
            profiles: profiles
                .into_iter()
                .map(|p| (p.agent_type.clone(), p))
                .collect(),
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create a session of the given agent type.
    ///
    /// # Errors
    /// Returns error if the agent type is not configured or its history
    /// store rejects the session id.
    pub async fn create_session(
        &self,
        agent_type: &str,
        session_id: Option<SessionId>,
    ) -> Result<SessionId, ManagerError> {
        let profile = self
            .profiles
            .get(agent_type)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownAgentType(agent_type.to_string()))?;
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let engine = AgentEngine::new(
            session_id.clone(),
            profile,
            Arc::clone(&self.executor),
            self.config,
            self.events.clone(),
        )?;
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), engine);

        tracing::info!(session_id = %session_id, agent_type, "Session created");
        Ok(session_id)
    }

    /// Get the engine of a session.
    pub async fn get(&self, session_id: &str) -> Option<Arc<AgentEngine>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn engine(&self, session_id: &str) -> Result<Arc<AgentEngine>, ManagerError> {
        self.get(session_id)
            .await
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))
    }

    /// Start a turn.
    ///
    /// # Errors
    /// Returns error if the session does not exist or a turn is running.
    pub async fn execute(
        &self,
        session_id: &str,
        input: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<JoinHandle<()>, ManagerError> {
        let engine = self.engine(session_id).await?;
        if engine.is_executing() {
            return Err(ManagerError::AlreadyRunning);
        }
        Ok(engine.execute_with_stream(input, routing_key))
    }

    /// Cancel the running turn of a session.
    ///
    /// # Errors
    /// Returns error if the session does not exist.
    pub async fn cancel(&self, session_id: &str) -> Result<bool, ManagerError> {
        Ok(self.engine(session_id).await?.cancel())
    }

    /// Clear the history of a session.
    ///
    /// # Errors
    /// Returns error if the session does not exist or the store fails.
    pub async fn clear_history(&self, session_id: &str) -> Result<(), ManagerError> {
        self.engine(session_id).await?.clear_history().await?;
        Ok(())
    }

    /// Cancel and forget a session.
    ///
    /// # Errors
    /// Returns error if the session does not exist.
    pub async fn terminate(&self, session_id: &str) -> Result<(), ManagerError> {
        let engine = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        if engine.phase() != Phase::Idle {
            engine.cancel();
        }
        tracing::info!(session_id, "Session terminated");
        Ok(())
    }

    /// List live sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|engine| SessionInfo {
                session_id: engine.session_id().to_string(),
                agent_type: engine.agent_type().to_string(),
                is_executing: engine.is_executing(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StaticPrompt;
    use crate::storage::MemoryHistoryFactory;
    use tiflis_executor::{ScriptedExecutor, scripted::fixtures};

    fn manager(executor: ScriptedExecutor) -> (SessionManager, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let profile = AgentProfile::new("coder", StaticPrompt(String::new()), MemoryHistoryFactory::new());
        (
            SessionManager::new(Arc::new(executor), EngineConfig::default(), [profile], tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_unknown_agent_type() {
        let (manager, _rx) = manager(ScriptedExecutor::default());
        assert!(matches!(
            manager.create_session("painter", None).await,
            Err(ManagerError::UnknownAgentType(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_concurrent_turns() {
        let executor = ScriptedExecutor::new(fixtures::streaming_text(&["slow"]))
            .with_step_delay(std::time::Duration::from_secs(1));
        let (manager, _rx) = manager(executor);
        let id = manager.create_session("coder", Some("s1".into())).await.unwrap();

        let handle = manager.execute(&id, "one", "r").await.unwrap();
        assert!(matches!(
            manager.execute(&id, "two", "r").await,
            Err(ManagerError::AlreadyRunning)
        ));
        assert!(manager.list().await[0].is_executing);
        handle.await.unwrap();

        assert!(!manager.list().await[0].is_executing);
        manager.terminate(&id).await.unwrap();
        assert!(manager.get(&id).await.is_none());
        assert!(matches!(manager.cancel(&id).await, Err(ManagerError::NotFound(_))));
    }
}
