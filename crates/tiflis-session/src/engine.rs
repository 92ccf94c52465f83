//! Agent execution engine.
//!
//! Drives one conversational turn at a time through a [`ReactiveExecutor`],
//! streaming [`ContentBlock`]s as they are produced.
//!
//! Per session the engine moves through
//! `Idle -> Processing -> Executing -> {Idle | Cancelled}`. The phase lives in
//! a single mutex-guarded field and every block emission re-checks it while
//! holding the lock, so once [`AgentEngine::cancel`] returns no block of the
//! cancelled turn can be observed.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tiflis_core::{
    ContentBlock, ConversationEntry, HistoryError, HistoryStore, SessionId,
    blocks::{accumulate, final_text, merge},
    traits::truncate_history,
};
use tiflis_executor::{ExecutorError, Message, ReactiveExecutor, parse_step};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentProfile;

/// Content of the status block closing a completed turn.
pub const COMPLETION_STATUS: &str = "Response complete";

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("History error: {0}")]
    History(#[from] HistoryError),
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

fn default_history_window() -> usize {
    20
}

fn default_cancel_protection_ms() -> u64 {
    500
}

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of most recent conversation entries kept.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Window after a turn starts during which `cancel` is ignored.
    #[serde(default = "default_cancel_protection_ms")]
    pub cancel_protection_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            cancel_protection_ms: default_cancel_protection_ms(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn cancel_protection(&self) -> Duration {
        Duration::from_millis(self.cancel_protection_ms)
    }
}

/// Execution phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Pre-execution work (e.g. transcription) is running.
    Processing,
    Executing {
        started_at: Instant,
    },
    /// The last turn was cancelled. Cleared when the next turn starts.
    Cancelled,
}

/// Event emitted by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A turn started executing.
    TurnStarted {
        session_id: SessionId,
        routing_key: String,
    },
    /// Blocks produced by the running turn.
    ///
    /// Streaming events carry a single block with `is_complete == false`.
    /// The final event carries a status (or error) block, and on success
    /// the final text and merged blocks of the turn.
    Blocks {
        session_id: SessionId,
        routing_key: String,
        blocks: Vec<ContentBlock>,
        is_complete: bool,
        final_text: Option<String>,
        merged_blocks: Option<Vec<ContentBlock>>,
    },
}

struct TurnState {
    phase: Phase,
    /// Incremented per turn; stale turn tasks compare against it.
    generation: u64,
    abort: CancellationToken,
}

/// Agent execution engine for one session.
pub struct AgentEngine {
    session_id: SessionId,
    profile: AgentProfile,
    executor: Arc<dyn ReactiveExecutor>,
    store: Arc<dyn HistoryStore>,
    config: EngineConfig,
    state: Mutex<TurnState>,
    history: RwLock<Vec<ConversationEntry>>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentEngine {
    /// Create an engine. History is backed by the profile's store factory.
    ///
    /// # Errors
    /// Returns error if the factory rejects the session id.
    pub fn new(
        session_id: impl Into<SessionId>,
        profile: AgentProfile,
        executor: Arc<dyn ReactiveExecutor>,
        config: EngineConfig,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<Arc<Self>, EngineError> {
        let session_id = session_id.into();
        let store = profile.history.create(&session_id)?;
        Ok(Arc::new(Self {
            session_id,
            profile,
            executor,
            store,
            config,
            state: Mutex::new(TurnState {
                phase: Phase::Idle,
                generation: 0,
                abort: CancellationToken::new(),
            }),
            history: RwLock::new(Vec::new()),
            events,
        }))
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn agent_type(&self) -> &str {
        &self.profile.agent_type
    }

    /// The history store backing this session.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    fn lock_state(&self) -> MutexGuard<'_, TurnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.lock_state().phase
    }

    /// True while pre-execution work or a turn is running.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        matches!(self.phase(), Phase::Processing | Phase::Executing { .. })
    }

    #[must_use]
    pub fn is_executing(&self) -> bool {
        matches!(self.phase(), Phase::Executing { .. })
    }

    /// Whether the last turn was cancelled.
    ///
    /// Callers use this to discard anything that arrives after a cancel was
    /// issued but before the stream loop observed it.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.phase() == Phase::Cancelled
    }

    /// When the running turn started executing.
    #[must_use]
    pub fn execution_started_at(&self) -> Option<Instant> {
        match self.phase() {
            Phase::Executing { started_at } => Some(started_at),
            _ => None,
        }
    }

    /// In-memory copy of the conversation history.
    #[must_use]
    pub fn history(&self) -> Vec<ConversationEntry> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Enter the pre-execution phase.
    ///
    /// Returns a token that is cancelled if [`cancel`](Self::cancel) is
    /// called before execution starts. Callers must check
    /// [`is_processing`](Self::is_processing) first.
    pub fn start_processing(&self) -> CancellationToken {
        let mut state = self.lock_state();
        state.generation += 1;
        state.phase = Phase::Processing;
        state.abort = CancellationToken::new();
        tracing::debug!(session_id = %self.session_id, "Processing started");
        state.abort.clone()
    }

    /// Leave the pre-execution phase without touching the abort token.
    pub fn end_processing(&self) {
        let mut state = self.lock_state();
        if state.phase == Phase::Processing {
            state.phase = Phase::Idle;
        }
    }

    /// Cancel the running turn or pre-execution work.
    ///
    /// Returns `false` when there is nothing to cancel, or when the running
    /// turn started less than the protection window ago: such a request was
    /// meant for the previous turn.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock_state();
        match state.phase {
            Phase::Idle | Phase::Cancelled => false,
            Phase::Executing { started_at }
                if started_at.elapsed() < self.config.cancel_protection() =>
            {
                tracing::info!(
                    session_id = %self.session_id,
                    elapsed_ms = started_at.elapsed().as_millis(),
                    "Ignoring cancel inside protection window"
                );
                false
            }
            Phase::Processing | Phase::Executing { .. } => {
                state.phase = Phase::Cancelled;
                state.abort.cancel();
                tracing::info!(session_id = %self.session_id, "Turn cancelled");
                true
            }
        }
    }

    /// Start executing a turn in the background.
    ///
    /// The phase switches to `Executing` before this returns. Blocks are
    /// delivered as [`AgentEvent`]s; the handle resolves when the turn ends.
    pub fn execute_with_stream(
        self: &Arc<Self>,
        input: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> JoinHandle<()> {
        let input = input.into();
        let routing_key = routing_key.into();

        let (generation, token) = {
            let mut state = self.lock_state();
            if state.phase != Phase::Processing {
                state.generation += 1;
            }
            state.phase = Phase::Executing {
                started_at: Instant::now(),
            };
            state.abort = CancellationToken::new();
            (state.generation, state.abort.clone())
        };

        self.send(AgentEvent::TurnStarted {
            session_id: self.session_id.clone(),
            routing_key: routing_key.clone(),
        });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_turn(generation, token, input, routing_key).await;
        })
    }

    /// Clear both the in-memory and persisted history.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn clear_history(&self) -> Result<(), EngineError> {
        self.store.clear_history().await?;
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn run_turn(
        self: Arc<Self>,
        generation: u64,
        token: CancellationToken,
        input: String,
        routing_key: String,
    ) {
        match self.stream_turn(generation, &token, &input, &routing_key).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(session_id = %self.session_id, "Turn stopped after cancellation");
            }
            Err(e) => {
                if token.is_cancelled() {
                    tracing::debug!(session_id = %self.session_id, "Swallowing error of cancelled turn: {e}");
                    return;
                }
                tracing::error!(session_id = %self.session_id, "Turn failed: {e}");
                let error = ContentBlock::error(e.to_string(), Some(error_code(&e).to_string()));
                self.finish(generation, &routing_key, error, None, None);
            }
        }
    }

    /// Stream one turn. `Ok(false)` means the turn was cancelled or
    /// superseded and must produce no further effects.
    async fn stream_turn(
        &self,
        generation: u64,
        token: &CancellationToken,
        input: &str,
        routing_key: &str,
    ) -> Result<bool, EngineError> {
        let mut history = self.store.load_history().await?;
        *self.history.write().unwrap_or_else(PoisonError::into_inner) = history.clone();

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.profile.system_prompt.build(&self.session_id)));
        messages.extend(history.iter().map(Message::from));
        messages.push(Message::user(input));

        let tools = self.profile.tools.tools();
        let mut steps = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(false),
            steps = self.executor.invoke(messages, tools) => steps?,
        };

        let mut accumulated: Vec<ContentBlock> = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(false),
                next = steps.next() => next,
            };
            let Some(step) = next else { break };

            for block in parse_step(&step?) {
                if !self.emit_streaming(generation, routing_key, block.clone()) {
                    return Ok(false);
                }
                accumulate(&mut accumulated, [block]);
            }
        }
        drop(steps);

        if !self.is_current(generation) {
            return Ok(false);
        }

        let final_text = final_text(&accumulated).unwrap_or_default().to_owned();
        let previous = history.clone();
        history.push(ConversationEntry::user(input));
        history.push(ConversationEntry::assistant(final_text.clone()));
        truncate_history(&mut history, self.config.history_window);
        self.store.save_history(&history).await?;
        if !self.is_current(generation) {
            self.roll_back(&previous).await;
            return Ok(false);
        }
        *self.history.write().unwrap_or_else(PoisonError::into_inner) = history;

        let merged = merge(&accumulated);
        if let Err(e) = self
            .profile
            .completion_hook
            .on_execution_complete(&self.session_id, self.store.as_ref(), &merged, &final_text)
            .await
        {
            tracing::warn!(session_id = %self.session_id, "Completion hook failed: {e}");
        }
        if !self.is_current(generation) {
            self.roll_back(&previous).await;
            return Ok(false);
        }

        Ok(self.finish(
            generation,
            routing_key,
            ContentBlock::status(COMPLETION_STATUS),
            Some(final_text),
            Some(merged),
        ))
    }

    /// Restore the history a cancelled turn had already persisted.
    async fn roll_back(&self, previous: &[ConversationEntry]) {
        tracing::info!(session_id = %self.session_id, "Discarding history of cancelled turn");
        if let Err(e) = self.store.save_history(previous).await {
            tracing::error!(session_id = %self.session_id, "Failed to restore history: {e}");
        }
        *self.history.write().unwrap_or_else(PoisonError::into_inner) = previous.to_vec();
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock_state();
        state.generation == generation && matches!(state.phase, Phase::Executing { .. })
    }

    /// Emit one streaming block if the turn is still live.
    fn emit_streaming(&self, generation: u64, routing_key: &str, block: ContentBlock) -> bool {
        let state = self.lock_state();
        if state.generation != generation || !matches!(state.phase, Phase::Executing { .. }) {
            return false;
        }
        self.send(AgentEvent::Blocks {
            session_id: self.session_id.clone(),
            routing_key: routing_key.to_owned(),
            blocks: vec![block],
            is_complete: false,
            final_text: None,
            merged_blocks: None,
        });
        true
    }

    /// Emit the closing block and return to `Idle` if the turn is still live.
    fn finish(
        &self,
        generation: u64,
        routing_key: &str,
        block: ContentBlock,
        final_text: Option<String>,
        merged_blocks: Option<Vec<ContentBlock>>,
    ) -> bool {
        let mut state = self.lock_state();
        if state.generation != generation || !matches!(state.phase, Phase::Executing { .. }) {
            return false;
        }
        self.send(AgentEvent::Blocks {
            session_id: self.session_id.clone(),
            routing_key: routing_key.to_owned(),
            blocks: vec![block],
            is_complete: true,
            final_text,
            merged_blocks,
        });
        state.phase = Phase::Idle;
        true
    }

    fn send(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(session_id = %self.session_id, "No event listener, dropping event");
        }
    }
}

const fn error_code(error: &EngineError) -> &'static str {
    match error {
        EngineError::History(_) => "HISTORY_ERROR",
        EngineError::Executor(_) => "EXECUTION_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{CompletionHook, StaticPrompt};
    use crate::storage::MemoryHistoryFactory;
    use async_trait::async_trait;
    use tiflis_core::{BlockKind, ToolStatus};
    use tiflis_executor::{ExecutorStep, ScriptedExecutor, scripted::fixtures};

    fn profile() -> AgentProfile {
        AgentProfile::new("coder", StaticPrompt("You are a coder.".into()), MemoryHistoryFactory::new())
    }

    fn engine_with(
        executor: ScriptedExecutor,
        profile: AgentProfile,
        config: EngineConfig,
    ) -> (Arc<AgentEngine>, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = AgentEngine::new("s1", profile, Arc::new(executor), config, tx).unwrap();
        (engine, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn block_events(events: &[AgentEvent]) -> Vec<(&[ContentBlock], bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Blocks {
                    blocks, is_complete, ..
                } => Some((blocks.as_slice(), *is_complete)),
                AgentEvent::TurnStarted { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let (engine, mut rx) = engine_with(ScriptedExecutor::default(), profile(), EngineConfig::default());
        assert!(!engine.cancel());
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(!engine.was_cancelled());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_turn_streams_and_completes() {
        let executor = ScriptedExecutor::new(fixtures::tool_round_trip("u1", "calc", "42", "It is 42."));
        let (engine, mut rx) = engine_with(executor.clone(), profile(), EngineConfig::default());

        engine.execute_with_stream("what is 6*7?", "route-1").await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(&events[0], AgentEvent::TurnStarted { routing_key, .. } if routing_key == "route-1"));
        let blocks = block_events(&events);
        assert_eq!(blocks.len(), 4);
        assert!(blocks[..3].iter().all(|(b, complete)| b.len() == 1 && !complete));

        let AgentEvent::Blocks {
            blocks,
            is_complete,
            final_text,
            merged_blocks,
            ..
        } = events.last().unwrap()
        else {
            panic!("expected final blocks");
        };
        assert!(is_complete);
        assert!(matches!(&blocks[0].kind, BlockKind::Status { content } if content == COMPLETION_STATUS));
        assert_eq!(final_text.as_deref(), Some("It is 42."));
        let merged = merged_blocks.as_ref().unwrap();
        assert_eq!(merged.len(), 2);
        let tool = merged[0].as_tool().unwrap();
        assert_eq!(tool.tool_status, ToolStatus::Completed);
        assert_eq!(tool.tool_output.as_deref(), Some("42"));

        assert_eq!(engine.phase(), Phase::Idle);
        let history = engine.store().load_history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "what is 6*7?");
        assert_eq!(history[1].content, "It is 42.");
        assert_eq!(engine.history(), history);

        let invocations = executor.invocations();
        assert_eq!(
            invocations[0],
            vec![Message::system("You are a coder."), Message::user("what is 6*7?")]
        );
    }

    #[tokio::test]
    async fn test_history_feeds_next_turn_and_is_bounded() {
        let executor = ScriptedExecutor::new(fixtures::streaming_text(&["ok"]));
        let config = EngineConfig {
            history_window: 2,
            ..EngineConfig::default()
        };
        let (engine, _rx) = engine_with(executor.clone(), profile(), config);

        engine.execute_with_stream("first", "r").await.unwrap();
        engine.execute_with_stream("second", "r").await.unwrap();

        let second = &executor.invocations()[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[1], Message::user("first"));
        assert_eq!(second[2], Message::assistant("ok"));

        let history = engine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_inside_protection_window_is_ignored() {
        let executor = ScriptedExecutor::new(fixtures::streaming_text(&["done"]))
            .with_step_delay(Duration::from_millis(100));
        let (engine, mut rx) = engine_with(executor, profile(), EngineConfig::default());

        let handle = engine.execute_with_stream("go", "r");
        assert!(!engine.cancel());
        assert!(!engine.was_cancelled());
        handle.await.unwrap();

        let events = drain(&mut rx);
        assert!(block_events(&events).last().is_some_and(|(_, complete)| *complete));
        assert_eq!(engine.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_window_stops_emission() {
        let executor = ScriptedExecutor::new(fixtures::streaming_text(&["a", "b", "c"]))
            .with_step_delay(Duration::from_millis(400));
        let (engine, mut rx) = engine_with(executor, profile(), EngineConfig::default());

        let handle = engine.execute_with_stream("go", "r");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(engine.cancel());
        assert!(engine.was_cancelled());
        assert!(!engine.is_processing());
        handle.await.unwrap();

        let events = drain(&mut rx);
        let blocks = block_events(&events);
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].1);
        assert!(engine.history().is_empty());
        assert!(engine.store().load_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_executor_failure_emits_single_error() {
        let executor = ScriptedExecutor::new(fixtures::streaming_text(&["partial"]))
            .with_failure("model unavailable");
        let (engine, mut rx) = engine_with(executor, profile(), EngineConfig::default());

        engine.execute_with_stream("go", "r").await.unwrap();

        let events = drain(&mut rx);
        let blocks = block_events(&events);
        assert_eq!(blocks.len(), 2);
        let (last, complete) = blocks[1];
        assert!(complete);
        assert!(matches!(
            &last[0].kind,
            BlockKind::Error { content, error_code } if content.contains("model unavailable")
                && error_code.as_deref() == Some("EXECUTION_ERROR")
        ));
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(engine.store().load_history().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_preempts_pending_failure() {
        let executor = ScriptedExecutor::new(vec![ExecutorStep::default()])
            .with_step_delay(Duration::from_secs(1))
            .with_failure("connection reset");
        let (engine, mut rx) = engine_with(executor, profile(), EngineConfig::default());

        let handle = engine.execute_with_stream("go", "r");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(engine.cancel());
        handle.await.unwrap();

        assert!(block_events(&drain(&mut rx)).is_empty());
        assert!(engine.was_cancelled());
    }

    #[test]
    fn test_processing_cancel_and_end() {
        let (engine, _rx) = engine_with(ScriptedExecutor::default(), profile(), EngineConfig::default());

        let token = engine.start_processing();
        assert!(engine.is_processing());
        assert!(!engine.is_executing());
        assert!(engine.cancel());
        assert!(token.is_cancelled());
        assert!(engine.was_cancelled());

        let token = engine.start_processing();
        assert!(!engine.was_cancelled());
        engine.end_processing();
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(!token.is_cancelled());
    }

    #[derive(Default)]
    struct RecordingHook(Mutex<Vec<(usize, String)>>);

    #[async_trait]
    impl CompletionHook for Arc<RecordingHook> {
        async fn on_execution_complete(
            &self,
            _session_id: &str,
            store: &dyn HistoryStore,
            merged_blocks: &[ContentBlock],
            final_text: &str,
        ) -> Result<(), HistoryError> {
            self.0.lock().unwrap().push((merged_blocks.len(), final_text.to_string()));
            store
                .save_additional_state("last_answer", serde_json::json!(final_text))
                .await
        }
    }

    #[tokio::test]
    async fn test_completion_hook_runs_once() {
        let hook = Arc::new(RecordingHook::default());
        let executor = ScriptedExecutor::new(fixtures::tool_round_trip("u1", "ls", "a.txt", "One file."));
        let (engine, _rx) = engine_with(
            executor,
            profile().with_completion_hook(Arc::clone(&hook)),
            EngineConfig::default(),
        );

        engine.execute_with_stream("list", "r").await.unwrap();

        assert_eq!(*hook.0.lock().unwrap(), vec![(2, "One file.".to_string())]);
        let saved = engine.store().load_additional_state("last_answer").await.unwrap();
        assert_eq!(saved, Some(serde_json::json!("One file.")));
    }

    /// Memory store whose saves take two seconds.
    #[derive(Default)]
    struct SlowStore(crate::storage::MemoryHistoryStore);

    #[async_trait]
    impl HistoryStore for SlowStore {
        async fn load_history(&self) -> Result<Vec<ConversationEntry>, HistoryError> {
            self.0.load_history().await
        }

        async fn save_history(&self, entries: &[ConversationEntry]) -> Result<(), HistoryError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.0.save_history(entries).await
        }

        async fn clear_history(&self) -> Result<(), HistoryError> {
            self.0.clear_history().await
        }
    }

    struct SharedSlowStore(Arc<SlowStore>);

    impl crate::agent::HistoryStoreFactory for SharedSlowStore {
        fn create(&self, _session_id: &str) -> Result<Arc<dyn HistoryStore>, HistoryError> {
            Ok(Arc::clone(&self.0) as Arc<dyn HistoryStore>)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_saving_discards_turn() {
        let store = Arc::new(SlowStore::default());
        let hook = Arc::new(RecordingHook::default());
        let profile = AgentProfile::new(
            "coder",
            StaticPrompt("You are a coder.".into()),
            SharedSlowStore(Arc::clone(&store)),
        )
        .with_completion_hook(Arc::clone(&hook));
        let executor = ScriptedExecutor::new(fixtures::streaming_text(&["done"]));
        let (engine, mut rx) = engine_with(executor, profile, EngineConfig::default());

        let handle = engine.execute_with_stream("go", "r");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.cancel());
        handle.await.unwrap();

        assert!(engine.was_cancelled());
        assert!(hook.0.lock().unwrap().is_empty());
        assert!(engine.history().is_empty());
        assert!(store.load_history().await.unwrap().is_empty());
        let events = drain(&mut rx);
        assert!(block_events(&events).iter().all(|(_, complete)| !complete));
    }
}
