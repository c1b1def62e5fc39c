//! Model service adapters for ratchet.
//!
//! All providers implement the `ratchet_core::Provider` trait.
//! [`build_provider`] selects the adapter from configuration and
//! [`ModelGateway`] wraps it with retries and reply validation.

pub mod anthropic;
pub mod gateway;
mod http;
pub mod openai_compat;

pub use anthropic::AnthropicProvider;
pub use gateway::{ModelGateway, RetryPolicy};
pub use openai_compat::OpenAiCompatProvider;

use ratchet_config::AppConfig;
use ratchet_core::error::ModelError;
use ratchet_core::provider::Provider;
use std::sync::Arc;
use tracing::info;

/// Build the configured provider.
///
/// Every provider except `ollama` needs an API key; unknown names are treated
/// as OpenAI-compatible endpoints and must carry an `api_url`.
pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn Provider>, ModelError> {
    let name = config.provider.as_str();
    let api_url = config.resolve_api_url();
    let api_key = config.resolve_api_key();

    let require_key = || {
        api_key.clone().ok_or_else(|| {
            ModelError::NotConfigured(format!(
                "No API key for provider '{name}'. Set RATCHET_API_KEY or add api_key to config.toml"
            ))
        })
    };

    let provider: Arc<dyn Provider> = match name {
        "anthropic" => {
            let mut p = AnthropicProvider::new(require_key()?);
            if let Some(url) = api_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        "openai" => match api_url {
            Some(url) => Arc::new(OpenAiCompatProvider::new("openai", url, require_key()?)),
            None => Arc::new(OpenAiCompatProvider::openai(require_key()?)),
        },
        "openrouter" => match api_url {
            Some(url) => Arc::new(OpenAiCompatProvider::new("openrouter", url, require_key()?)),
            None => Arc::new(OpenAiCompatProvider::openrouter(require_key()?)),
        },
        "ollama" => Arc::new(OpenAiCompatProvider::ollama(api_url.as_deref())),
        other => {
            let url = api_url.ok_or_else(|| {
                ModelError::NotConfigured(format!(
                    "Unknown provider '{other}': set providers.{other}.api_url"
                ))
            })?;
            Arc::new(OpenAiCompatProvider::new(other, url, require_key()?))
        }
    };

    info!(provider = %provider.name(), model = %config.model, "Model provider ready");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_config::ProviderConfig;

    fn config(provider: &str, key: Option<&str>) -> AppConfig {
        AppConfig {
            provider: provider.into(),
            api_key: key.map(String::from),
            ..AppConfig::default()
        }
    }

    #[test]
    fn anthropic_requires_key() {
        assert!(matches!(
            build_provider(&config("anthropic", None)),
            Err(ModelError::NotConfigured(_))
        ));
        let p = build_provider(&config("anthropic", Some("sk-ant-test"))).unwrap();
        assert_eq!(p.name(), "anthropic");
    }

    #[test]
    fn ollama_needs_no_key() {
        let p = build_provider(&config("ollama", None)).unwrap();
        assert_eq!(p.name(), "ollama");
    }

    #[test]
    fn custom_provider_needs_url() {
        assert!(build_provider(&config("vllm", Some("k"))).is_err());

        let mut cfg = config("vllm", Some("k"));
        cfg.providers.insert(
            "vllm".into(),
            ProviderConfig {
                api_key: None,
                api_url: Some("http://localhost:8000/v1".into()),
            },
        );
        let p = build_provider(&cfg).unwrap();
        assert_eq!(p.name(), "vllm");
    }
}
