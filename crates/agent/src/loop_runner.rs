//! The agent loop — the checkpointed state machine driving one conversation.
//!
//! ```text
//! AwaitingUserInput ──user──▶ AwaitingModelResponse ──answer──▶ Done ─▶ AwaitingUserInput
//!                                 ▲          │
//!                                 │      tool calls
//!                                 │          ▼
//!                    all results ─┴─ AwaitingToolResults ◀── DispatchingTools
//! ```
//!
//! Every append is followed by a checkpoint. The control state is always
//! recomputed from the log, so a loop opened after a crash continues exactly
//! where the last durable write left it.

use crate::cancel::{CancelHandle, CancelLevel, CancelWatch};
use futures::stream::{FuturesUnordered, StreamExt};
use ratchet_config::AppConfig;
use ratchet_core::error::{Error, ModelError, Result, StoreError, ToolFailureKind};
use ratchet_core::event::{AgentEvent, EventBus};
use ratchet_core::message::{ConversationId, Message, MessageBody};
use ratchet_core::provider::ModelReply;
use ratchet_core::state::{ControlState, pending_calls};
use ratchet_core::store::{LogCursor, MessageStore};
use ratchet_core::tool::{ToolCallRequest, ToolOutcome, ToolResult};
use ratchet_providers::ModelGateway;
use ratchet_tools::ToolDispatcher;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Assistant entry recorded when a turn is cancelled.
pub const CANCELLED_NOTICE: &str = "Turn cancelled by user.";

/// Assistant entry recorded when a turn exhausts its tool rounds.
pub const MAX_ROUNDS_NOTICE: &str = "I've reached the maximum number of tool call rounds for this turn. \
     Please review the results so far and tell me how to continue.";

/// Per-loop behaviour knobs.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Model replies with tool calls allowed in one turn
    pub max_tool_rounds: usize,
    /// Run the calls of one reply concurrently
    pub parallel_tool_calls: bool,
    /// Checkpoints kept per conversation; `None` keeps all
    pub checkpoint_retention: Option<usize>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 25,
            parallel_tool_calls: true,
            checkpoint_retention: None,
        }
    }
}

impl From<&AppConfig> for LoopSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_tool_rounds: config.agent.max_tool_rounds,
            parallel_tool_calls: config.agent.parallel_tool_calls,
            checkpoint_retention: config.store.checkpoint_retention,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model answered; `tool_rounds` counts replies that requested tools.
    Answer { text: String, tool_rounds: usize },
    /// The user cancelled; `abandoned` calls were recorded as cancelled.
    Cancelled { abandoned: usize },
}

impl TurnOutcome {
    /// The text recorded as the turn's assistant entry.
    pub fn text(&self) -> &str {
        match self {
            Self::Answer { text, .. } => text,
            Self::Cancelled { .. } => CANCELLED_NOTICE,
        }
    }
}

/// Shared collaborators; opens loops for individual conversations.
#[derive(Clone)]
pub struct LoopBuilder {
    store: Arc<dyn MessageStore>,
    gateway: Arc<ModelGateway>,
    dispatcher: Arc<ToolDispatcher>,
    events: EventBus,
    settings: LoopSettings,
}

impl LoopBuilder {
    pub fn settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Load `conversation_id` from its latest checkpoint plus any newer log
    /// entries. A conversation with no messages starts empty.
    pub async fn open(&self, conversation_id: ConversationId) -> Result<AgentLoop> {
        let mut agent = AgentLoop {
            conversation_id,
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            dispatcher: self.dispatcher.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
            cancel: CancelHandle::new(),
            messages: Vec::new(),
            state: ControlState::AwaitingUserInput,
            checkpointed: 0,
        };
        agent.restore().await?;
        Ok(agent)
    }
}

/// The agent loop for one conversation.
///
/// The loop is the only writer of its conversation. It keeps an in-memory
/// mirror of the log that always equals the durable log.
pub struct AgentLoop {
    conversation_id: ConversationId,
    store: Arc<dyn MessageStore>,
    gateway: Arc<ModelGateway>,
    dispatcher: Arc<ToolDispatcher>,
    events: EventBus,
    settings: LoopSettings,
    cancel: CancelHandle,
    messages: Vec<Message>,
    state: ControlState,
    /// Sequence of the latest checkpoint
    checkpointed: u64,
}

impl AgentLoop {
    pub fn builder(
        store: Arc<dyn MessageStore>,
        gateway: Arc<ModelGateway>,
        dispatcher: Arc<ToolDispatcher>,
    ) -> LoopBuilder {
        LoopBuilder {
            store,
            gateway,
            dispatcher,
            events: EventBus::default(),
            settings: LoopSettings::default(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Tool calls still waiting for a result.
    pub fn pending_calls(&self) -> Vec<ToolCallRequest> {
        pending_calls(&self.messages)
    }

    pub fn last_checkpoint(&self) -> u64 {
        self.checkpointed
    }

    /// A handle that cancels the running (or next) turn.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Whether the last turn stopped before reaching an answer.
    pub fn needs_resume(&self) -> bool {
        !matches!(
            self.state,
            ControlState::AwaitingUserInput | ControlState::Done
        )
    }

    /// Record user input and run the turn to completion.
    ///
    /// Rejected with [`Error::InvalidState`] while tool calls are unresolved;
    /// call [`AgentLoop::resume`] first.
    pub async fn submit(&mut self, text: impl Into<String>) -> Result<TurnOutcome> {
        if !self.state.accepts_user_input() {
            return Err(Error::InvalidState {
                state: self.state.to_string(),
                reason: format!(
                    "{} tool call(s) are unresolved; resume the turn first",
                    self.pending_calls().len()
                ),
            });
        }

        self.cancel.reset();
        self.record(MessageBody::user(text)).await?;
        info!(conversation_id = %self.conversation_id, sequence = self.checkpointed, "Turn started");
        self.events.publish(AgentEvent::TurnStarted {
            conversation_id: self.conversation_id.clone(),
            resumed: false,
            timestamp: chrono::Utc::now(),
        });
        self.drive().await
    }

    /// Continue an interrupted turn. Returns `None` when the log is at rest.
    pub async fn resume(&mut self) -> Result<Option<TurnOutcome>> {
        if !self.needs_resume() {
            return Ok(None);
        }

        self.cancel.reset();
        info!(
            conversation_id = %self.conversation_id,
            state = %self.state,
            pending = self.pending_calls().len(),
            "Resuming turn"
        );
        self.events.publish(AgentEvent::TurnStarted {
            conversation_id: self.conversation_id.clone(),
            resumed: true,
            timestamp: chrono::Utc::now(),
        });
        self.drive().await.map(Some)
    }

    async fn drive(&mut self) -> Result<TurnOutcome> {
        let mut watch = self.cancel.watch();
        let result = self.run_turn(&mut watch).await;

        if let Err(e) = &result {
            warn!(conversation_id = %self.conversation_id, state = %self.state, error = %e, "Turn failed");
            self.events.publish(AgentEvent::TurnFailed {
                conversation_id: self.conversation_id.clone(),
                state: self.state,
                error: e.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }
        result
    }

    async fn run_turn(&mut self, watch: &mut CancelWatch) -> Result<TurnOutcome> {
        let mut rounds = 0;

        loop {
            let level = watch.level();
            if level > CancelLevel::None {
                return self.finish_cancelled(level).await;
            }

            match self.state {
                ControlState::AwaitingUserInput | ControlState::Done => {
                    return Err(Error::InvalidState {
                        state: self.state.to_string(),
                        reason: "no turn in progress".into(),
                    });
                }

                ControlState::AwaitingModelResponse => {
                    if rounds >= self.settings.max_tool_rounds {
                        warn!(
                            conversation_id = %self.conversation_id,
                            rounds,
                            "Max tool rounds reached, ending turn"
                        );
                        return self.finish_answer(MAX_ROUNDS_NOTICE.to_string(), rounds).await;
                    }

                    let definitions = self.dispatcher.definitions();
                    let reply = tokio::select! {
                        biased;
                        _ = watch.reached(CancelLevel::Graceful) => None,
                        reply = self.gateway.complete(&self.messages, &definitions) => Some(reply),
                    };

                    // A cancelled request is handled at the top of the loop
                    let Some(reply) = reply else { continue };

                    match reply? {
                        ModelReply::FinalAnswer { text } => {
                            return self.finish_answer(text, rounds).await;
                        }
                        ModelReply::ToolCalls { calls, narration } => {
                            rounds += 1;
                            if let Some(text) = narration {
                                self.events.publish(AgentEvent::ModelNarration {
                                    conversation_id: self.conversation_id.clone(),
                                    text,
                                    timestamp: chrono::Utc::now(),
                                });
                            }
                            self.record_calls(calls).await?;
                        }
                    }
                }

                ControlState::DispatchingTools | ControlState::AwaitingToolResults => {
                    if let Some(outcome) = self.dispatch_pending(watch).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Append one `tool_call` per request, in the model's order, then checkpoint.
    async fn record_calls(&mut self, calls: Vec<ToolCallRequest>) -> Result<()> {
        let known: HashSet<&str> = self.messages.iter().filter_map(|m| m.call_id()).collect();
        if let Some(reused) = calls.iter().find(|c| known.contains(c.call_id.as_str())) {
            return Err(ModelError::Protocol(format!(
                "Call id '{}' was already used in this conversation",
                reused.call_id
            ))
            .into());
        }

        debug!(
            conversation_id = %self.conversation_id,
            count = calls.len(),
            "Recording tool calls"
        );
        for call in &calls {
            self.append(MessageBody::tool_call(call)).await?;
        }
        self.checkpoint().await
    }

    /// Hand every unresolved call to the dispatcher and record results as
    /// they arrive. Returns an outcome only when the turn was cancelled.
    async fn dispatch_pending(&mut self, watch: &mut CancelWatch) -> Result<Option<TurnOutcome>> {
        let mut queue: VecDeque<ToolCallRequest> = self.pending_calls().into();
        if queue.is_empty() {
            self.state = ControlState::derive(&self.messages);
            return Ok(None);
        }

        let limit = if self.settings.parallel_tool_calls {
            queue.len()
        } else {
            1
        };
        self.state = ControlState::AwaitingToolResults;

        let mut in_flight = FuturesUnordered::new();
        let mut draining = false;

        loop {
            while !draining && in_flight.len() < limit {
                let Some(call) = queue.pop_front() else { break };
                info!(
                    conversation_id = %self.conversation_id,
                    call_id = %call.call_id,
                    tool = %call.tool_name,
                    "Dispatching tool call"
                );
                self.events.publish(AgentEvent::ToolDispatched {
                    conversation_id: self.conversation_id.clone(),
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    timestamp: chrono::Utc::now(),
                });
                in_flight.push(invoke(self.dispatcher.clone(), call));
            }

            if in_flight.is_empty() {
                break;
            }

            let wake_at = if draining {
                CancelLevel::Hard
            } else {
                CancelLevel::Graceful
            };

            tokio::select! {
                biased;
                _ = watch.reached(wake_at) => {
                    if watch.level() >= CancelLevel::Hard {
                        warn!(
                            conversation_id = %self.conversation_id,
                            abandoned = in_flight.len(),
                            "Hard cancel, abandoning in-flight tool calls"
                        );
                        drop(in_flight);
                        return self.finish_cancelled(CancelLevel::Hard).await.map(Some);
                    }
                    info!(
                        conversation_id = %self.conversation_id,
                        in_flight = in_flight.len(),
                        "Cancel requested, waiting for in-flight tool calls"
                    );
                    draining = true;
                }
                Some((result, elapsed)) = in_flight.next() => {
                    self.record_result(result, elapsed).await?;
                }
            }
        }

        if draining {
            return self.finish_cancelled(CancelLevel::Graceful).await.map(Some);
        }

        self.state = ControlState::derive(&self.messages);
        Ok(None)
    }

    /// Append a `tool_result` and checkpoint it on its own.
    ///
    /// A conflict means the result is already durable (a previous run got
    /// further than its checkpoint); the stored result stands.
    async fn record_result(&mut self, result: ToolResult, elapsed: Duration) -> Result<()> {
        let call_id = result.call_id.clone();
        let tool_name = result.tool_name.clone();
        let failure = match &result.outcome {
            ToolOutcome::Failure { kind, .. } => Some(*kind),
            ToolOutcome::Success { .. } => None,
        };

        match self.append(MessageBody::tool_result(result)).await {
            Ok(_) => self.checkpoint().await?,
            Err(StoreError::Conflict { .. }) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    call_id = %call_id,
                    "Result already recorded, keeping the stored one"
                );
                self.refresh().await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.events.publish(AgentEvent::ToolCompleted {
            conversation_id: self.conversation_id.clone(),
            call_id,
            tool_name,
            success: failure.is_none(),
            failure,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn finish_answer(&mut self, text: String, tool_rounds: usize) -> Result<TurnOutcome> {
        self.record(MessageBody::assistant(text.clone())).await?;
        info!(
            conversation_id = %self.conversation_id,
            sequence = self.checkpointed,
            tool_rounds,
            "Turn finished"
        );
        self.events.publish(AgentEvent::TurnFinished {
            conversation_id: self.conversation_id.clone(),
            answer: text.clone(),
            tool_rounds,
            timestamp: chrono::Utc::now(),
        });
        self.prune().await;
        Ok(TurnOutcome::Answer { text, tool_rounds })
    }

    /// Close every unresolved call with a cancelled result and end the turn.
    async fn finish_cancelled(&mut self, level: CancelLevel) -> Result<TurnOutcome> {
        let abandoned = self.pending_calls();
        for call in &abandoned {
            let message = match level {
                CancelLevel::Hard => "Abandoned by hard cancel",
                _ => "Not started before the turn was cancelled",
            };
            let result = ToolResult::failure(call, ToolFailureKind::Cancelled, message);
            self.record_result(result, Duration::ZERO).await?;
        }

        self.record(MessageBody::assistant(CANCELLED_NOTICE)).await?;
        info!(
            conversation_id = %self.conversation_id,
            level = ?level,
            abandoned = abandoned.len(),
            "Turn cancelled"
        );
        self.events.publish(AgentEvent::TurnFinished {
            conversation_id: self.conversation_id.clone(),
            answer: CANCELLED_NOTICE.to_string(),
            tool_rounds: 0,
            timestamp: chrono::Utc::now(),
        });
        self.prune().await;
        Ok(TurnOutcome::Cancelled {
            abandoned: abandoned.len(),
        })
    }

    // --- Persistence ---

    async fn append(&mut self, body: MessageBody) -> std::result::Result<u64, StoreError> {
        let sequence = self.store.append(&self.conversation_id, body.clone()).await?;
        self.messages.push(Message::new(sequence, body));
        Ok(sequence)
    }

    async fn record(&mut self, body: MessageBody) -> Result<()> {
        self.append(body).await?;
        self.checkpoint().await
    }

    /// Checkpoint the end of the log with the state derived from it.
    async fn checkpoint(&mut self) -> Result<()> {
        self.state = ControlState::derive(&self.messages);
        let Some(sequence) = self.messages.last().map(|m| m.sequence) else {
            return Ok(());
        };
        if sequence <= self.checkpointed {
            return Ok(());
        }

        let id = self
            .store
            .checkpoint(&self.conversation_id, sequence, self.state)
            .await?;
        self.checkpointed = sequence;
        debug!(checkpoint = %id, state = %self.state, "Checkpoint written");
        Ok(())
    }

    async fn restore(&mut self) -> Result<()> {
        let (mut messages, from) = match self.store.latest_checkpoint(&self.conversation_id).await? {
            Some(checkpoint) => {
                let replayed = ControlState::derive(&checkpoint.messages);
                let recorded = match checkpoint.state {
                    ControlState::Done => ControlState::AwaitingUserInput,
                    other => other,
                };
                if replayed != recorded {
                    warn!(
                        checkpoint = %checkpoint.id(),
                        recorded = %checkpoint.state,
                        replayed = %replayed,
                        "Checkpoint state differs from replayed log, using the log"
                    );
                }
                self.checkpointed = checkpoint.sequence;
                (checkpoint.messages, checkpoint.sequence + 1)
            }
            None => (Vec::new(), 1),
        };

        let tail = LogCursor::new(self.store.as_ref(), self.conversation_id.clone(), from)
            .collect()
            .await?;
        let ahead = tail.len();
        messages.extend(tail);
        self.messages = messages;
        self.state = ControlState::derive(&self.messages);

        if ahead > 0 {
            info!(
                conversation_id = %self.conversation_id,
                ahead,
                "Log is ahead of its latest checkpoint"
            );
            self.checkpoint().await?;
        }

        debug!(
            conversation_id = %self.conversation_id,
            messages = self.messages.len(),
            state = %self.state,
            "Conversation restored"
        );
        Ok(())
    }

    /// Pull entries written outside this loop's mirror.
    async fn refresh(&mut self) -> Result<()> {
        let from = self.messages.last().map_or(1, |m| m.sequence + 1);
        let tail = LogCursor::new(self.store.as_ref(), self.conversation_id.clone(), from)
            .collect()
            .await?;
        self.messages.extend(tail);
        self.checkpoint().await
    }

    async fn prune(&self) {
        let Some(keep) = self.settings.checkpoint_retention else {
            return;
        };
        match self.store.prune_checkpoints(&self.conversation_id, keep).await {
            Ok(0) => {}
            Ok(removed) => debug!(conversation_id = %self.conversation_id, removed, "Pruned checkpoints"),
            Err(e) => warn!(conversation_id = %self.conversation_id, error = %e, "Checkpoint pruning failed"),
        }
    }
}

async fn invoke(dispatcher: Arc<ToolDispatcher>, call: ToolCallRequest) -> (ToolResult, Duration) {
    let started = Instant::now();
    let result = dispatcher.dispatch(&call).await;
    (result, started.elapsed())
}
