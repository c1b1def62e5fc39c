//! Terminal rendering of messages and loop events.

use ratchet_agent::TurnOutcome;
use ratchet_core::event::AgentEvent;
use ratchet_core::message::{Message, MessageBody};
use ratchet_core::tool::ToolOutcome;

const PREVIEW_CHARS: usize = 200;

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= PREVIEW_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}…")
    }
}

/// One line per log entry, as shown by `history`.
pub fn message_line(message: &Message) -> String {
    let seq = message.sequence;
    match &message.body {
        MessageBody::User { text } => format!("{seq:>5}  user         {}", preview(text)),
        MessageBody::Assistant { text } => format!("{seq:>5}  assistant    {}", preview(text)),
        MessageBody::ToolCall {
            call_id,
            tool_name,
            arguments,
        } => format!("{seq:>5}  tool_call    {tool_name}({arguments}) [{call_id}]"),
        MessageBody::ToolResult {
            call_id, outcome, ..
        } => {
            let status = match outcome {
                ToolOutcome::Success { .. } => "ok",
                ToolOutcome::Failure { .. } => "failed",
            };
            format!(
                "{seq:>5}  tool_result  {status} [{call_id}] {}",
                preview(&outcome.model_text())
            )
        }
    }
}

/// Tool-activity notice for the REPL, or `None` for events shown elsewhere.
pub fn event_line(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::ToolDispatched {
            tool_name, call_id, ..
        } => Some(format!("  ⚙ {tool_name} [{call_id}]")),
        AgentEvent::ToolCompleted {
            tool_name,
            success: true,
            duration_ms,
            ..
        } => Some(format!("  ✓ {tool_name} ({duration_ms} ms)")),
        AgentEvent::ToolCompleted {
            tool_name, failure, ..
        } => {
            let kind = failure.map(|k| k.to_string()).unwrap_or_default();
            Some(format!("  ✗ {tool_name} failed: {kind}"))
        }
        AgentEvent::ModelNarration { text, .. } => Some(format!("  … {}", preview(text))),
        AgentEvent::TurnStarted { resumed: true, .. } => {
            Some("  ↻ resuming interrupted turn".to_string())
        }
        _ => None,
    }
}

pub fn print_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Answer { text, .. } => {
            println!();
            for line in text.lines() {
                println!("  Assistant > {line}");
            }
            println!();
        }
        TurnOutcome::Cancelled { abandoned } => {
            eprintln!("  [Cancelled] {abandoned} tool call(s) abandoned");
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_core::error::ToolFailureKind;
    use ratchet_core::tool::{ToolCallRequest, ToolResult};

    #[test]
    fn tool_lines_show_linkage() {
        let call = ToolCallRequest::new("call_1", "list_dir", serde_json::json!({"path": "/tmp"}));
        let line = message_line(&Message::new(2, MessageBody::tool_call(&call)));
        assert!(line.contains("list_dir"));
        assert!(line.contains("[call_1]"));

        let failed = ToolResult::failure(&call, ToolFailureKind::Timeout, "after 3s");
        let line = message_line(&Message::new(3, MessageBody::tool_result(failed)));
        assert!(line.contains("failed [call_1]"));
        assert!(line.contains("timeout"));
    }

    #[test]
    fn narration_is_shown_as_activity() {
        let event = AgentEvent::ModelNarration {
            conversation_id: "c1".into(),
            text: "Let me look\nat the files".into(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(
            event_line(&event).as_deref(),
            Some("  … Let me look at the files")
        );
    }

    #[test]
    fn long_text_is_truncated() {
        let long = "x".repeat(500);
        let line = message_line(&Message::new(1, MessageBody::user(long)));
        assert!(line.ends_with('…'));
    }
}
