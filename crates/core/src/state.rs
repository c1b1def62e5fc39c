//! Loop control states and their derivation from the log.
//!
//! The control state is never an independent source of truth: it is always
//! recomputable from the message log alone, which is what makes resume after
//! a crash deterministic.

use crate::message::{Message, MessageBody};
use crate::tool::ToolCallRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Where the agent loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    /// Idle; the next step needs user input
    AwaitingUserInput,
    /// The log ends in something the model has not answered yet
    AwaitingModelResponse,
    /// Tool calls were recorded and none of them has a result yet
    DispatchingTools,
    /// Some tool calls of the current round have results, others do not
    AwaitingToolResults,
    /// A final answer was just surfaced; collapses to `AwaitingUserInput`
    Done,
}

impl ControlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingUserInput => "awaiting_user_input",
            Self::AwaitingModelResponse => "awaiting_model_response",
            Self::DispatchingTools => "dispatching_tools",
            Self::AwaitingToolResults => "awaiting_tool_results",
            Self::Done => "done",
        }
    }

    /// Recompute the state purely from log contents.
    ///
    /// `Done` is never derived: a log ending in an answer is at rest.
    pub fn derive(messages: &[Message]) -> Self {
        let Some(last) = messages.last() else {
            return Self::AwaitingUserInput;
        };

        if !pending_calls(messages).is_empty() {
            return match last.body {
                MessageBody::ToolCall { .. } => Self::DispatchingTools,
                _ => Self::AwaitingToolResults,
            };
        }

        match last.body {
            MessageBody::Assistant { .. } => Self::AwaitingUserInput,
            MessageBody::User { .. }
            | MessageBody::ToolResult { .. }
            | MessageBody::ToolCall { .. } => Self::AwaitingModelResponse,
        }
    }

    /// Whether a new user message may be appended in this state.
    ///
    /// A turn that failed on the model leaves the log at
    /// `AwaitingModelResponse`; the user may continue with new input.
    pub fn accepts_user_input(&self) -> bool {
        matches!(
            self,
            Self::AwaitingUserInput | Self::Done | Self::AwaitingModelResponse
        )
    }

    /// Whether the state has unresolved tool calls.
    pub fn has_pending_tools(&self) -> bool {
        matches!(self, Self::DispatchingTools | Self::AwaitingToolResults)
    }
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ControlState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_user_input" => Ok(Self::AwaitingUserInput),
            "awaiting_model_response" => Ok(Self::AwaitingModelResponse),
            "dispatching_tools" => Ok(Self::DispatchingTools),
            "awaiting_tool_results" => Ok(Self::AwaitingToolResults),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown control state '{other}'")),
        }
    }
}

/// `tool_call`s in log order that have no matching `tool_result`.
pub fn pending_calls(messages: &[Message]) -> Vec<ToolCallRequest> {
    let resolved: HashSet<&str> = messages
        .iter()
        .filter_map(|m| match &m.body {
            MessageBody::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();

    messages
        .iter()
        .filter_map(|m| match &m.body {
            MessageBody::ToolCall {
                call_id,
                tool_name,
                arguments,
            } if !resolved.contains(call_id.as_str()) => Some(ToolCallRequest::new(
                call_id.clone(),
                tool_name.clone(),
                arguments.clone(),
            )),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolOutcome;

    fn log(bodies: Vec<MessageBody>) -> Vec<Message> {
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, b)| Message::new(i as u64 + 1, b))
            .collect()
    }

    fn call(id: &str) -> MessageBody {
        MessageBody::ToolCall {
            call_id: id.into(),
            tool_name: "list_dir".into(),
            arguments: serde_json::json!({"path": "/tmp"}),
        }
    }

    fn result(id: &str) -> MessageBody {
        MessageBody::ToolResult {
            call_id: id.into(),
            tool_name: "list_dir".into(),
            outcome: ToolOutcome::Success {
                output: "[]".into(),
                data: None,
            },
        }
    }

    #[test]
    fn empty_log_awaits_user() {
        assert_eq!(ControlState::derive(&[]), ControlState::AwaitingUserInput);
    }

    #[test]
    fn user_message_awaits_model() {
        let msgs = log(vec![MessageBody::user("hi")]);
        assert_eq!(ControlState::derive(&msgs), ControlState::AwaitingModelResponse);
    }

    #[test]
    fn fresh_calls_are_dispatching() {
        let msgs = log(vec![MessageBody::user("hi"), call("a"), call("b")]);
        assert_eq!(ControlState::derive(&msgs), ControlState::DispatchingTools);
        assert_eq!(pending_calls(&msgs).len(), 2);
    }

    #[test]
    fn partial_results_are_awaiting_results() {
        let msgs = log(vec![MessageBody::user("hi"), call("a"), call("b"), result("b")]);
        assert_eq!(ControlState::derive(&msgs), ControlState::AwaitingToolResults);
        let pending = pending_calls(&msgs);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].call_id, "a");
    }

    #[test]
    fn all_results_return_to_model() {
        let msgs = log(vec![MessageBody::user("hi"), call("a"), result("a")]);
        assert_eq!(ControlState::derive(&msgs), ControlState::AwaitingModelResponse);
    }

    #[test]
    fn answer_rests_at_user_input() {
        let msgs = log(vec![
            MessageBody::user("hi"),
            call("a"),
            result("a"),
            MessageBody::assistant("done"),
        ]);
        assert_eq!(ControlState::derive(&msgs), ControlState::AwaitingUserInput);
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            ControlState::AwaitingUserInput,
            ControlState::AwaitingModelResponse,
            ControlState::DispatchingTools,
            ControlState::AwaitingToolResults,
            ControlState::Done,
        ] {
            assert_eq!(state.as_str().parse::<ControlState>().unwrap(), state);
        }
    }

    #[test]
    fn user_input_blocked_while_tools_pending() {
        assert!(!ControlState::DispatchingTools.accepts_user_input());
        assert!(!ControlState::AwaitingToolResults.accepts_user_input());
        assert!(ControlState::AwaitingUserInput.accepts_user_input());
    }
}
