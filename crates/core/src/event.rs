//! Agent event stream — what a presentation layer renders.
//!
//! The loop publishes an event at each visible step of a turn. Subscribers
//! (the terminal REPL, tests) consume them without coupling to the loop.

use crate::error::ToolFailureKind;
use crate::message::ConversationId;
use crate::state::ControlState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All events emitted by the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A turn began (user input recorded, or a resumed turn picked up)
    TurnStarted {
        conversation_id: ConversationId,
        resumed: bool,
        timestamp: DateTime<Utc>,
    },

    /// Text the model sent alongside tool calls; not part of the log
    ModelNarration {
        conversation_id: ConversationId,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool call was handed to the dispatcher
    ToolDispatched {
        conversation_id: ConversationId,
        call_id: String,
        tool_name: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool result was recorded
    ToolCompleted {
        conversation_id: ConversationId,
        call_id: String,
        tool_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<ToolFailureKind>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The turn produced a final answer
    TurnFinished {
        conversation_id: ConversationId,
        answer: String,
        tool_rounds: usize,
        timestamp: DateTime<Utc>,
    },

    /// The turn stopped without an answer; the log stays resumable
    TurnFailed {
        conversation_id: ConversationId,
        state: ControlState,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::TurnStarted { conversation_id, .. }
            | Self::ModelNarration { conversation_id, .. }
            | Self::ToolDispatched { conversation_id, .. }
            | Self::ToolCompleted { conversation_id, .. }
            | Self::TurnFinished { conversation_id, .. }
            | Self::TurnFailed { conversation_id, .. } => conversation_id,
        }
    }
}

/// A broadcast-based event bus for agent events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag and miss events rather than blocking the loop.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<AgentEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(AgentEvent::ToolCompleted {
            conversation_id: "c1".into(),
            call_id: "call_1".into(),
            tool_name: "list_dir".into(),
            success: true,
            failure: None,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            AgentEvent::ToolCompleted {
                tool_name, success, ..
            } => {
                assert_eq!(tool_name, "list_dir");
                assert!(success);
            }
            _ => panic!("Expected ToolCompleted event"),
        }
        assert_eq!(event.conversation_id().as_str(), "c1");
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(AgentEvent::TurnFailed {
            conversation_id: "c1".into(),
            state: ControlState::AwaitingModelResponse,
            error: "no subscribers".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = AgentEvent::TurnStarted {
            conversation_id: "c1".into(),
            resumed: true,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "turn_started");
        assert_eq!(json["resumed"], true);
    }
}
