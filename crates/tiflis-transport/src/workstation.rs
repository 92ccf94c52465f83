//! Workstation side of the relay.
//!
//! [`SessionForwarder`] turns engine events into `session.output` frames and
//! keeps per-session mirror state for late subscribers.
//! [`WorkstationHandler`] answers client requests arriving through the relay.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tiflis_core::{BlockStore, ContentBlock, HistoryError, SessionId};
use tiflis_session::{AgentEvent, EngineError, ManagerError, SessionManager};
use tokio::sync::mpsc;

use crate::protocol::{CLIENT_DISCONNECTED, Envelope, ErrorCode};

pub const SESSION_OUTPUT: &str = "session.output";
pub const SESSION_SUBSCRIBED: &str = "session.subscribed";
pub const SESSION_CREATED: &str = "session.created";
pub const SESSION_CANCELLED: &str = "session.cancelled";
pub const SESSION_TERMINATED: &str = "session.terminated";
pub const SESSION_LIST: &str = "session.list";
pub const SESSION_ERROR: &str = "session.error";
pub const HISTORY_CLEARED: &str = "history.cleared";

/// Payload of `session.output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutput {
    pub session_id: SessionId,
    pub routing_key: String,
    pub content_blocks: Vec<ContentBlock>,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_blocks: Option<Vec<ContentBlock>>,
}

/// Payload of `session.subscribed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSubscribed {
    pub session_id: SessionId,
    pub content_blocks: Vec<ContentBlock>,
    pub is_streaming: bool,
}

/// Forwards engine output to the relay and keeps mirror state.
pub struct SessionForwarder {
    stores: Mutex<HashMap<SessionId, Arc<BlockStore>>>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl SessionForwarder {
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    /// Mirror state of a session, created on first use.
    pub fn store(&self, session_id: &str) -> Arc<BlockStore> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            stores
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(BlockStore::new())),
        )
    }

    /// Drop the mirror state of a session.
    pub fn forget(&self, session_id: &str) {
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    /// Mark a session's turn as stopped without completion.
    pub fn halt(&self, session_id: &str) {
        self.store(session_id).halt();
    }

    fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            tracing::debug!("Relay link closed, dropping frame");
        }
    }

    /// Fold one engine event into mirror state and send it on.
    pub fn forward(&self, event: AgentEvent) {
        match event {
            AgentEvent::TurnStarted { session_id, .. } => self.store(&session_id).begin_turn(),
            AgentEvent::Blocks {
                session_id,
                routing_key,
                blocks,
                is_complete,
                final_text,
                merged_blocks,
            } => {
                let store = self.store(&session_id);
                match (&merged_blocks, is_complete) {
                    (Some(merged), true) => store.complete(merged.clone()),
                    (None, true) => {
                        store.push_blocks(blocks.clone());
                        store.halt();
                    }
                    (_, false) => store.push_blocks(blocks.clone()),
                }
                let output = SessionOutput {
                    session_id,
                    routing_key,
                    content_blocks: blocks,
                    is_complete,
                    final_text,
                    merged_blocks,
                };
                match Envelope::from_payload(SESSION_OUTPUT, &output) {
                    Ok(envelope) => self.send(envelope),
                    Err(e) => tracing::error!("Failed to serialize session output: {e}"),
                }
            }
        }
    }

    /// Catch a device up on a session: a targeted `session.subscribed`
    /// carrying everything accumulated so far.
    pub fn subscribe(&self, session_id: &str, device_id: &str, id: Option<String>) {
        let (content_blocks, is_streaming) = self.store(session_id).snapshot();
        let subscribed = SessionSubscribed {
            session_id: session_id.to_string(),
            content_blocks,
            is_streaming,
        };
        match Envelope::from_payload(SESSION_SUBSCRIBED, &subscribed) {
            Ok(message) => self.send(Envelope::to_device(device_id, &message.with_id(id))),
            Err(e) => tracing::error!("Failed to serialize subscription: {e}"),
        }
    }

    /// Drain engine events until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
        while let Some(event) = events.recv().await {
            self.forward(event);
        }
    }
}

/// Client request, as delivered to the workstation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkstationRequest {
    #[serde(rename = "session.create")]
    Create {
        agent_type: String,
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    #[serde(rename = "session.execute")]
    Execute {
        session_id: SessionId,
        content: String,
        #[serde(default)]
        routing_key: Option<String>,
    },
    #[serde(rename = "session.cancel")]
    Cancel { session_id: SessionId },
    #[serde(rename = "session.subscribe")]
    Subscribe { session_id: SessionId },
    #[serde(rename = "session.terminate")]
    Terminate { session_id: SessionId },
    #[serde(rename = "session.list")]
    List {},
    #[serde(rename = "history.clear")]
    ClearHistory { session_id: SessionId },
}

impl WorkstationRequest {
    /// Decode a relayed envelope.
    ///
    /// # Errors
    /// Returns error for unknown types or payloads not matching their type.
    pub fn decode(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        let payload = match &envelope.payload {
            Value::Null => json!({}),
            other => other.clone(),
        };
        serde_json::from_value(json!({ "type": envelope.kind, "payload": payload }))
    }
}

const fn error_code(error: &ManagerError) -> &'static str {
    match error {
        ManagerError::NotFound(_) => "SESSION_NOT_FOUND",
        ManagerError::UnknownAgentType(_) => "UNKNOWN_AGENT_TYPE",
        ManagerError::AlreadyRunning => "SESSION_BUSY",
        ManagerError::Engine(EngineError::History(HistoryError::InvalidKey(_))) => "INVALID_PAYLOAD",
        ManagerError::Engine(_) => "INTERNAL_ERROR",
    }
}

/// Answers client requests with the session manager.
pub struct WorkstationHandler {
    manager: Arc<SessionManager>,
    forwarder: Arc<SessionForwarder>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl WorkstationHandler {
    #[must_use]
    pub const fn new(
        manager: Arc<SessionManager>,
        forwarder: Arc<SessionForwarder>,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            manager,
            forwarder,
            outbound,
        }
    }

    fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            tracing::debug!("Relay link closed, dropping frame");
        }
    }

    fn reply(&self, device_id: Option<&str>, message: Envelope) {
        match device_id {
            Some(device_id) => self.send(Envelope::to_device(device_id, &message)),
            None => self.send(message),
        }
    }

    /// Handle one envelope relayed from a client.
    ///
    /// Relay notices are not requests. Sessions are shared by every device
    /// of the tunnel, so a departing device leaves nothing to release.
    pub async fn handle(&self, envelope: Envelope) {
        if envelope.kind == CLIENT_DISCONNECTED {
            tracing::debug!(device_id = ?envelope.payload_str("device_id"), "Device left the tunnel");
            return;
        }
        let device_id = envelope.payload_str("device_id").map(str::to_string);
        let device_id = device_id.as_deref();
        let id = envelope.id.clone();

        let request = match WorkstationRequest::decode(&envelope) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(kind = %envelope.kind, "Unhandled request: {e}");
                self.reply(
                    device_id,
                    Envelope::error(id, ErrorCode::InvalidPayload, format!("Unsupported request: {e}")),
                );
                return;
            }
        };

        let session_id = match &request {
            WorkstationRequest::Execute { session_id, .. }
            | WorkstationRequest::Cancel { session_id }
            | WorkstationRequest::Subscribe { session_id }
            | WorkstationRequest::Terminate { session_id }
            | WorkstationRequest::ClearHistory { session_id } => Some(session_id.clone()),
            _ => None,
        };

        if let Err(e) = self.dispatch(request, device_id, id.clone()).await {
            tracing::debug!(error = %e, "Request failed");
            self.reply(
                device_id,
                Envelope::new(
                    SESSION_ERROR,
                    json!({ "session_id": session_id, "code": error_code(&e), "message": e.to_string() }),
                )
                .with_id(id),
            );
        }
    }

    async fn dispatch(
        &self,
        request: WorkstationRequest,
        device_id: Option<&str>,
        id: Option<String>,
    ) -> Result<(), ManagerError> {
        match request {
            WorkstationRequest::Create {
                agent_type,
                session_id,
            } => {
                let session_id = self.manager.create_session(&agent_type, session_id).await?;
                self.send(
                    Envelope::new(
                        SESSION_CREATED,
                        json!({ "session_id": session_id, "agent_type": agent_type }),
                    )
                    .with_id(id),
                );
            }
            WorkstationRequest::Execute {
                session_id,
                content,
                routing_key,
            } => {
                let routing_key = routing_key
                    .or(id)
                    .or_else(|| device_id.map(str::to_string))
                    .unwrap_or_default();
                self.manager.execute(&session_id, content, routing_key).await?;
            }
            WorkstationRequest::Cancel { session_id } => {
                let cancelled = self.manager.cancel(&session_id).await?;
                if cancelled {
                    self.forwarder.halt(&session_id);
                }
                self.reply(
                    device_id,
                    Envelope::new(
                        SESSION_CANCELLED,
                        json!({ "session_id": session_id, "cancelled": cancelled }),
                    )
                    .with_id(id),
                );
            }
            WorkstationRequest::Subscribe { session_id } => {
                if self.manager.get(&session_id).await.is_none() {
                    return Err(ManagerError::NotFound(session_id));
                }
                match device_id {
                    Some(device_id) => self.forwarder.subscribe(&session_id, device_id, id),
                    None => tracing::debug!(session_id = %session_id, "Subscribe without device id"),
                }
            }
            WorkstationRequest::Terminate { session_id } => {
                self.manager.terminate(&session_id).await?;
                self.forwarder.forget(&session_id);
                self.send(
                    Envelope::new(SESSION_TERMINATED, json!({ "session_id": session_id })).with_id(id),
                );
            }
            WorkstationRequest::List {} => {
                let sessions: Vec<Value> = self
                    .manager
                    .list()
                    .await
                    .into_iter()
                    .map(|s| {
                        json!({
                            "session_id": s.session_id,
                            "agent_type": s.agent_type,
                            "is_executing": s.is_executing,
                        })
                    })
                    .collect();
                self.reply(
                    device_id,
                    Envelope::new(SESSION_LIST, json!({ "sessions": sessions })).with_id(id),
                );
            }
            WorkstationRequest::ClearHistory { session_id } => {
                self.manager.clear_history(&session_id).await?;
                self.send(
                    Envelope::new(HISTORY_CLEARED, json!({ "session_id": session_id })).with_id(id),
                );
            }
        }
        Ok(())
    }

    /// Handle relayed envelopes until the link is gone.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.handle(envelope).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiflis_core::{ToolStatus, accumulate};
    use tiflis_executor::{ScriptedExecutor, scripted::fixtures};
    use tiflis_session::{AgentProfile, EngineConfig, StaticPrompt, storage::MemoryHistoryFactory};

    fn blocks_event(session_id: &str, blocks: Vec<ContentBlock>, complete: bool) -> AgentEvent {
        AgentEvent::Blocks {
            session_id: session_id.into(),
            routing_key: "r".into(),
            blocks,
            is_complete: complete,
            final_text: None,
            merged_blocks: None,
        }
    }

    #[test]
    fn test_request_decoding() {
        let env = Envelope::new(
            "session.execute",
            json!({ "session_id": "s1", "content": "hi", "device_id": "d1" }),
        );
        assert_eq!(
            WorkstationRequest::decode(&env).unwrap(),
            WorkstationRequest::Execute {
                session_id: "s1".into(),
                content: "hi".into(),
                routing_key: None,
            }
        );
        let list = Envelope::new("session.list", Value::Null);
        assert_eq!(WorkstationRequest::decode(&list).unwrap(), WorkstationRequest::List {});
        assert!(WorkstationRequest::decode(&Envelope::new("session.fly", json!({}))).is_err());
    }

    #[test]
    fn test_late_subscriber_gets_accumulated_state() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = SessionForwarder::new(tx);
        forwarder.forward(AgentEvent::TurnStarted {
            session_id: "s1".into(),
            routing_key: "r".into(),
        });
        forwarder.forward(blocks_event(
            "s1",
            vec![ContentBlock::tool_running("calc", Some("u1".into()), None)],
            false,
        ));
        forwarder.forward(blocks_event(
            "s1",
            vec![ContentBlock::tool_result("calc", Some("u1".into()), "42", false)],
            false,
        ));
        assert_eq!(rx.try_recv().unwrap().kind, SESSION_OUTPUT);
        assert_eq!(rx.try_recv().unwrap().kind, SESSION_OUTPUT);

        forwarder.subscribe("s1", "d9", Some("sub-1".into()));
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.kind, crate::protocol::FORWARD_TO_DEVICE);
        assert_eq!(envelope.payload["device_id"], "d9");
        let message: Envelope = serde_json::from_value(envelope.payload["message"].clone()).unwrap();
        assert_eq!(message.id.as_deref(), Some("sub-1"));
        let subscribed: SessionSubscribed = serde_json::from_value(message.payload).unwrap();
        assert!(subscribed.is_streaming);
        assert_eq!(subscribed.content_blocks.len(), 1);
        let tool = subscribed.content_blocks[0].as_tool().unwrap();
        assert_eq!(tool.tool_status, ToolStatus::Completed);
    }

    #[tokio::test]
    async fn test_execute_request_streams_output() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let profile = AgentProfile::new("coder", StaticPrompt(String::new()), MemoryHistoryFactory::new());
        let executor = ScriptedExecutor::new(fixtures::tool_round_trip("u1", "calc", "42", "done"));
        let manager = Arc::new(SessionManager::new(
            Arc::new(executor),
            EngineConfig::default(),
            [profile],
            events_tx,
        ));
        let forwarder = Arc::new(SessionForwarder::new(out_tx.clone()));
        tokio::spawn(Arc::clone(&forwarder).run(events_rx));
        let handler = WorkstationHandler::new(manager, forwarder, out_tx);

        handler
            .handle(Envelope::new(
                "session.create",
                json!({ "agent_type": "coder", "session_id": "s1", "device_id": "d1" }),
            ))
            .await;
        assert_eq!(out_rx.recv().await.unwrap().kind, SESSION_CREATED);

        handler
            .handle(Envelope::new(
                "session.execute",
                json!({ "session_id": "s1", "content": "go", "device_id": "d1" }),
            ))
            .await;

        let mut view = Vec::new();
        loop {
            let envelope = out_rx.recv().await.unwrap();
            let output: SessionOutput = serde_json::from_value(envelope.payload).unwrap();
            assert_eq!(output.routing_key, "d1");
            accumulate(&mut view, output.content_blocks);
            if output.is_complete {
                assert_eq!(output.final_text.as_deref(), Some("done"));
                break;
            }
        }
        let tools: Vec<_> = view.iter().filter_map(ContentBlock::as_tool).collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_output.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_unknown_session_reports_error_to_device() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(
            Arc::new(ScriptedExecutor::default()),
            EngineConfig::default(),
            [],
            events_tx,
        ));
        let handler = WorkstationHandler::new(
            manager,
            Arc::new(SessionForwarder::new(out_tx.clone())),
            out_tx,
        );

        let mut request = Envelope::new("session.cancel", json!({ "session_id": "nope", "device_id": "d1" }));
        request.id = Some("c1".into());
        handler.handle(request).await;

        let envelope = out_rx.recv().await.unwrap();
        let message: Envelope = serde_json::from_value(envelope.payload["message"].clone()).unwrap();
        assert_eq!(message.kind, SESSION_ERROR);
        assert_eq!(message.id.as_deref(), Some("c1"));
        assert_eq!(message.payload["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_client_departure_is_not_answered() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(
            Arc::new(ScriptedExecutor::default()),
            EngineConfig::default(),
            [],
            events_tx,
        ));
        let handler = WorkstationHandler::new(
            manager,
            Arc::new(SessionForwarder::new(out_tx.clone())),
            out_tx,
        );

        assert!(WorkstationRequest::decode(&Envelope::new(
            CLIENT_DISCONNECTED,
            json!({ "device_id": "d1" })
        ))
        .is_err());
        handler
            .handle(Envelope::new(CLIENT_DISCONNECTED, json!({ "device_id": "d1" })))
            .await;
        assert!(out_rx.try_recv().is_err());

        handler
            .handle(Envelope::new("session.list", json!({ "device_id": "d2" })))
            .await;
        let envelope = out_rx.try_recv().unwrap();
        assert_eq!(envelope.payload["device_id"], "d2");
    }
}
