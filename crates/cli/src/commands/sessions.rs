//! `ratchet sessions` — List stored conversations.

use super::runtime::open_store;
use ratchet_config::AppConfig;
use ratchet_core::store::MessageStore;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let store = open_store(&config).await?;
    let conversations = store.list_conversations().await?;

    if conversations.is_empty() {
        println!("No conversations yet. Start one with: ratchet chat");
        store.close().await;
        return Ok(());
    }

    println!("{:<38} {:>8} {:>8}  STATE", "CONVERSATION", "MESSAGES", "LAST");
    for summary in &conversations {
        let state = summary
            .checkpoint_state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:>8} {:>8}  {}",
            summary.conversation_id, summary.message_count, summary.last_sequence, state
        );
    }

    store.close().await;
    Ok(())
}
