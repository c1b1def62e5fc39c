//! `ratchet history` — Print a conversation's log or one of its checkpoints.

use super::render::message_line;
use super::runtime::open_store;
use ratchet_config::AppConfig;
use ratchet_core::message::ConversationId;
use ratchet_core::state::ControlState;
use ratchet_core::store::{LogCursor, MessageStore};

pub async fn run(id: String, at: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let store = open_store(&config).await?;
    let conversation_id = ConversationId(id);

    match at {
        Some(sequence) => {
            match store.checkpoint_at_or_before(&conversation_id, sequence).await? {
                Some(checkpoint) => {
                    println!(
                        "Checkpoint {} ({}, taken {})",
                        checkpoint.id(),
                        checkpoint.state,
                        checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                    for message in &checkpoint.messages {
                        println!("{}", message_line(message));
                    }
                }
                None => println!("No checkpoint at or before sequence {sequence}."),
            }
        }
        None => {
            let messages = LogCursor::new(&store, conversation_id.clone(), 1)
                .collect()
                .await?;
            if messages.is_empty() {
                println!("Conversation {conversation_id} has no messages.");
            } else {
                for message in &messages {
                    println!("{}", message_line(message));
                }
                let checkpoint = store.latest_checkpoint(&conversation_id).await?;
                println!();
                println!("State: {}", ControlState::derive(&messages));
                if let Some(checkpoint) = checkpoint {
                    println!("Latest checkpoint: {} ({})", checkpoint.id(), checkpoint.state);
                }
            }
        }
    }

    store.close().await;
    Ok(())
}
