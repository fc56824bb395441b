use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use keel_core::config::StepLlmConfig;

use crate::provider::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, ProviderError};

/// Per-pipeline-step LLM front door.
///
/// Owns the step's model/temperature/token budget and applies timeout plus
/// bounded retry with exponential backoff. Every LLM-calling phase holds one
/// executor so environments can tune each step independently.
pub struct LlmExecutor {
    provider: Arc<dyn LlmProvider>,
    config: StepLlmConfig,
    step_name: &'static str,
}

impl LlmExecutor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        config: StepLlmConfig,
        step_name: &'static str,
    ) -> Self {
        Self {
            provider,
            config,
            step_name,
        }
    }

    pub fn step_name(&self) -> &'static str {
        self.step_name
    }

    pub fn config(&self) -> &StepLlmConfig {
        &self.config
    }

    /// Send with the step's configured model and temperature.
    pub async fn generate(
        &self,
        system: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<ChatResponse, ProviderError> {
        self.generate_with(system, messages, self.config.temperature, self.config.max_tokens)
            .await
    }

    /// Send with explicit temperature/token overrides (e.g. temp-0 sensor
    /// calls sharing a step block with a warmer default).
    pub async fn generate_with(
        &self,
        system: &str,
        messages: Vec<ChatMessage>,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<ChatResponse, ProviderError> {
        let req = ChatRequest {
            model: self.config.model.clone(),
            system: system.to_string(),
            messages,
            temperature,
            max_tokens,
        };

        let mut last_err = ProviderError::Unavailable("no attempt made".to_string());
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                // Exponential backoff: 200ms, 400ms, 800ms, ...
                let delay = Duration::from_millis(200 * (1 << (attempt - 1)));
                tokio::time::sleep(delay).await;
            }

            let call = self.provider.send(&req);
            let result =
                match tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), call)
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(ProviderError::Timeout {
                        ms: self.config.timeout_ms,
                    }),
                };

            match result {
                Ok(resp) => {
                    debug!(
                        step = self.step_name,
                        model = %resp.model,
                        tokens_in = resp.tokens_in,
                        tokens_out = resp.tokens_out,
                        attempt,
                        "llm call complete"
                    );
                    return Ok(resp);
                }
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    warn!(
                        step = self.step_name,
                        provider = self.provider.name(),
                        attempt,
                        error = %e,
                        "llm call failed, retrying"
                    );
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}
