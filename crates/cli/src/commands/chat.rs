//! `ratchet chat` — Interactive REPL or single-message mode.

use super::render::{event_line, print_outcome};
use super::runtime::Runtime;
use ratchet_agent::{AgentLoop, CancelHandle, CancelLevel};
use ratchet_config::AppConfig;
use ratchet_core::event::EventBus;
use ratchet_core::message::ConversationId;
use std::future::Future;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

pub async fn run(
    conversation: Option<String>,
    message: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let runtime = Runtime::build(config).await?;

    let conversation_id = conversation
        .map(ConversationId)
        .unwrap_or_else(ConversationId::new);
    let mut agent = runtime.builder.open(conversation_id).await?;
    let printer = spawn_event_printer(&runtime.events);

    if agent.needs_resume() {
        eprintln!(
            "  Conversation {} stopped mid-turn ({}); resuming.",
            agent.conversation_id(),
            agent.state()
        );
        let result = resume_turn(&mut agent).await;
        report(&agent, result);
    }

    let result = match message {
        Some(msg) => {
            let cancel = agent.cancel_handle();
            let outcome = with_interrupts(agent.submit(msg), cancel).await;
            match outcome {
                Ok(outcome) => {
                    println!("{}", outcome.text());
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        None => repl(&runtime, &mut agent).await,
    };

    printer.abort();
    runtime.shutdown().await;
    result
}

async fn repl(runtime: &Runtime, agent: &mut AgentLoop) -> Result<(), Box<dyn std::error::Error>> {
    println!("ratchet — interactive mode");
    println!("  Conversation: {}", agent.conversation_id());
    println!(
        "  Provider: {} | Model: {}",
        runtime.config.provider, runtime.config.model
    );
    println!("  Tools: {}", runtime.tool_names.join(", "));
    println!("  Ctrl-C cancels a running turn (twice aborts tools). /retry re-runs a failed turn, /exit quits.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else { break };

        let input = line.trim();
        match input {
            "" => continue,
            "/exit" | "/quit" => break,
            "/retry" => {
                let result = resume_turn(agent).await;
                if matches!(result, Ok(None)) {
                    println!("  Nothing to retry.\n");
                }
                report(agent, result);
            }
            text => {
                let cancel = agent.cancel_handle();
                let result = with_interrupts(agent.submit(text), cancel).await;
                report(agent, result.map(Some));
            }
        }
    }

    println!("  Goodbye. Continue later with: ratchet chat --conversation {}", agent.conversation_id());
    Ok(())
}

async fn resume_turn(
    agent: &mut AgentLoop,
) -> ratchet_core::Result<Option<ratchet_agent::TurnOutcome>> {
    let cancel = agent.cancel_handle();
    with_interrupts(agent.resume(), cancel).await
}

fn report(agent: &AgentLoop, result: ratchet_core::Result<Option<ratchet_agent::TurnOutcome>>) {
    match result {
        Ok(Some(outcome)) => print_outcome(&outcome),
        Ok(None) => {}
        Err(e) => {
            eprintln!("  [Error] {e}");
            if agent.needs_resume() {
                eprintln!("  The turn was saved ({}). Type /retry to continue it.", agent.state());
            }
            println!();
        }
    }
}

/// Run a turn, turning Ctrl-C into a graceful cancel and a second Ctrl-C into
/// a hard cancel.
pub(crate) async fn with_interrupts<F, T>(turn: F, cancel: CancelHandle) -> ratchet_core::Result<T>
where
    F: Future<Output = ratchet_core::Result<T>>,
{
    tokio::pin!(turn);
    loop {
        tokio::select! {
            result = &mut turn => return result,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Could not listen for Ctrl-C");
                    return turn.await;
                }
                if cancel.level() == CancelLevel::None {
                    eprintln!("\n  Cancelling after running tools finish (Ctrl-C again to abort them)...");
                    cancel.cancel();
                } else {
                    eprintln!("\n  Aborting running tools...");
                    cancel.abort();
                }
            }
        }
    }
}

/// Print tool activity to stderr while turns run.
pub(crate) fn spawn_event_printer(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = event_line(&event) {
                        eprintln!("{line}");
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
