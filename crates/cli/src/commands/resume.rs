//! `ratchet resume` — Finish a turn that stopped before its answer.

use super::chat::{spawn_event_printer, with_interrupts};
use super::render::print_outcome;
use super::runtime::Runtime;
use ratchet_config::AppConfig;
use ratchet_core::message::ConversationId;

pub async fn run(id: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let runtime = Runtime::build(config).await?;
    let mut agent = runtime.builder.open(ConversationId(id)).await?;

    if !agent.needs_resume() {
        println!(
            "Conversation {} is at rest ({}, {} messages). Nothing to resume.",
            agent.conversation_id(),
            agent.state(),
            agent.messages().len()
        );
        runtime.shutdown().await;
        return Ok(());
    }

    let pending = agent.pending_calls();
    if !pending.is_empty() {
        println!("Re-dispatching {} unresolved tool call(s):", pending.len());
        for call in &pending {
            println!("  - {} [{}]", call.tool_name, call.call_id);
        }
    }

    let printer = spawn_event_printer(&runtime.events);
    let cancel = agent.cancel_handle();
    let result = with_interrupts(agent.resume(), cancel).await;
    printer.abort();
    runtime.shutdown().await;

    if let Some(outcome) = result? {
        print_outcome(&outcome);
    }
    Ok(())
}
