//! ratchet CLI — the main entry point.
//!
//! Commands:
//! - `init`     — Write the default config file
//! - `chat`     — Interactive chat or single-message mode
//! - `resume`   — Finish an interrupted turn
//! - `sessions` — List stored conversations
//! - `history`  — Print a conversation's log

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "ratchet",
    about = "ratchet — a checkpointed coding agent",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write ~/.ratchet/config.toml with defaults
    Init,

    /// Chat with the agent
    Chat {
        /// Continue an existing conversation instead of starting a new one
        #[arg(short, long)]
        conversation: Option<String>,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Resume a conversation whose last turn was interrupted
    Resume {
        /// Conversation ID
        id: String,
    },

    /// List stored conversations
    Sessions,

    /// Print the messages of a conversation
    History {
        /// Conversation ID
        id: String,

        /// Show the checkpoint at or before this sequence instead of the full log
        #[arg(long)]
        at: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init => commands::init::run().await?,
        Commands::Chat {
            conversation,
            message,
        } => commands::chat::run(conversation, message).await?,
        Commands::Resume { id } => commands::resume::run(id).await?,
        Commands::Sessions => commands::sessions::run().await?,
        Commands::History { id, at } => commands::history::run(id, at).await?,
    }

    Ok(())
}
