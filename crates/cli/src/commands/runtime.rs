//! Wiring shared by the commands that talk to a model.

use ratchet_agent::{AgentLoop, LoopBuilder, LoopSettings, system_prompt};
use ratchet_config::AppConfig;
use ratchet_core::event::EventBus;
use ratchet_core::store::MessageStore;
use ratchet_providers::{ModelGateway, RetryPolicy, build_provider};
use ratchet_store::SqliteStore;
use ratchet_tools::{McpClient, ToolDispatcher, connect_servers, default_registry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Everything a chat session needs, built once from configuration.
pub struct Runtime {
    pub config: AppConfig,
    pub builder: LoopBuilder,
    pub events: EventBus,
    pub tool_names: Vec<String>,
    mcp_clients: Vec<Arc<McpClient>>,
    store: Arc<SqliteStore>,
}

impl Runtime {
    pub async fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if !config.has_api_key() && config.provider != "ollama" {
            print_missing_key_help(&config);
            return Err("No API key found. See above for setup instructions.".into());
        }

        let store = Arc::new(open_store(&config).await?);
        let provider = build_provider(&config)?;

        let working_dir = config.tools.resolved_working_dir();
        let prompt = system_prompt(config.system_prompt.as_deref(), &working_dir);
        let gateway = ModelGateway::new(provider, &config.model)
            .with_policy(RetryPolicy::from(&config.retry))
            .with_system_prompt(prompt)
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens);

        let mut registry = default_registry(&config.tools);
        let mcp_clients = connect_servers(
            &config.mcp_servers,
            &working_dir,
            Duration::from_secs(config.tools.startup_timeout_secs),
            &mut registry,
        )
        .await;
        let tool_names = registry.names().into_iter().map(String::from).collect();

        let dispatcher = ToolDispatcher::new(
            Arc::new(registry),
            Duration::from_secs(config.tools.timeout_secs),
        );

        let events = EventBus::default();
        let builder = AgentLoop::builder(store.clone(), Arc::new(gateway), Arc::new(dispatcher))
            .settings(LoopSettings::from(&config))
            .events(events.clone());

        info!(
            provider = %config.provider,
            model = %config.model,
            mcp_servers = mcp_clients.len(),
            "Runtime ready"
        );

        Ok(Self {
            config,
            builder,
            events,
            tool_names,
            mcp_clients,
            store,
        })
    }

    pub async fn shutdown(&self) {
        for client in &self.mcp_clients {
            if let Err(e) = client.close().await {
                debug!(error = %e, "Failed to close MCP server");
            }
        }
        self.store.close().await;
    }
}

/// Open the configured conversation database.
pub async fn open_store(config: &AppConfig) -> Result<SqliteStore, Box<dyn std::error::Error>> {
    let path = if config.store.is_in_memory() {
        ":memory:".to_string()
    } else {
        config.store.resolved_path().to_string_lossy().into_owned()
    };
    let store = SqliteStore::new(&path)
        .await
        .map_err(|e| format!("Failed to open conversation store at {path}: {e}"))?;
    debug!(backend = store.name(), path = %path, "Store opened");
    Ok(store)
}

fn print_missing_key_help(config: &AppConfig) {
    eprintln!();
    eprintln!("  ERROR: No API key configured for provider '{}'!", config.provider);
    eprintln!();
    eprintln!("  Set one of these environment variables (or put it in .env):");
    eprintln!("    RATCHET_API_KEY=...       (generic)");
    eprintln!("    ANTHROPIC_API_KEY=...     (provider = \"anthropic\")");
    eprintln!("    OPENAI_API_KEY=...        (provider = \"openai\")");
    eprintln!("    OPENROUTER_API_KEY=...    (provider = \"openrouter\")");
    eprintln!();
    eprintln!("  Or add it to your config file:");
    eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
    eprintln!();
}
