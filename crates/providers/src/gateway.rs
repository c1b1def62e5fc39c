//! Model gateway — retrying, validating front door to a provider.
//!
//! The loop never talks to a [`Provider`] directly. The gateway fills in the
//! request settings, retries transient failures with exponential backoff, and
//! rejects replies the loop could not act on.

use ratchet_config::RetryConfig;
use ratchet_core::error::ModelError;
use ratchet_core::message::Message;
use ratchet_core::provider::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backoff settings for transient model failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32, error: &ModelError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let mut delay = Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()));

        if let ModelError::RateLimited { retry_after_secs } = error {
            delay = delay.max(Duration::from_secs(*retry_after_secs));
        }

        delay.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }
}

/// Sends the conversation to the model and returns its decision.
pub struct ModelGateway {
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
    model: String,
    system_prompt: Option<String>,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl ModelGateway {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            policy: RetryPolicy::default(),
            model: model.into(),
            system_prompt: None,
            temperature: 0.3,
            max_tokens: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Ask the model what to do next given the full log and the tool schemas.
    pub async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, ModelError> {
        let request = ModelRequest {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        self.send(request).await.map(|response| response.reply)
    }

    /// Send a fully-formed request with retries and reply validation.
    pub async fn send(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(
                provider = %self.provider.name(),
                attempt,
                max_attempts,
                "Requesting model completion"
            );

            let error = match self.provider.complete(request.clone()).await {
                Ok(response) => {
                    validate_reply(&response.reply)?;
                    if let Some(usage) = &response.usage {
                        debug!(
                            model = %response.model,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "Model usage"
                        );
                    }
                    return Ok(response);
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                warn!(provider = %self.provider.name(), error = %error, "Model request failed");
                return Err(error);
            }
            if attempt >= max_attempts {
                warn!(
                    provider = %self.provider.name(),
                    attempts = attempt,
                    error = %error,
                    "Model request failed, retries exhausted"
                );
                return Err(error);
            }

            let delay = self.policy.backoff(attempt, &error);
            info!(
                provider = %self.provider.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient model failure, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Reject replies the loop cannot record unambiguously.
fn validate_reply(reply: &ModelReply) -> Result<(), ModelError> {
    let ModelReply::ToolCalls { calls, .. } = reply else {
        return Ok(());
    };

    if calls.is_empty() {
        return Err(ModelError::Protocol("Tool-call reply with no calls".into()));
    }

    let mut seen = HashSet::new();
    for call in calls {
        if call.call_id.trim().is_empty() {
            return Err(ModelError::Protocol(format!(
                "Call to '{}' has an empty call id",
                call.tool_name
            )));
        }
        if call.tool_name.trim().is_empty() {
            return Err(ModelError::Protocol(format!(
                "Call '{}' has an empty tool name",
                call.call_id
            )));
        }
        if !seen.insert(call.call_id.as_str()) {
            return Err(ModelError::Protocol(format!(
                "Duplicate call id '{}' in one reply",
                call.call_id
            )));
        }
    }
    Ok(())
}
