//! Text completion with a bounded retry budget.
//!
//! [`Completer`] is the single call boundary the optimization loop uses to reach
//! the model. Every attempt runs under a timeout; transient failures
//! (timeouts, transport errors, rate limits, 5xx) are retried with exponential
//! backoff until the attempt budget is spent. Non-transient failures return
//! immediately.

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

use super::litellm::{GenerationRequest, LlmProvider, Message};

/// Timeout and retry budget for a single completion call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_delay: Duration,
    /// Budget for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            attempt_timeout,
        }
    }

    /// Backoff before attempt number `attempt` (1-based; the first has none).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.base_delay.saturating_mul(factor)
    }

    /// Worst-case wall-clock time for one call under this policy.
    pub fn worst_case(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|a| self.delay_before(a) + self.attempt_timeout)
            .sum()
    }
}

/// Completion client: provider + model parameters + retry policy.
#[derive(Clone)]
pub struct Completer {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Completer {
    /// Creates a completer using the provider's default model.
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            model: String::new(),
            temperature: None,
            max_tokens: None,
            policy,
        }
    }

    /// Sets the model identifier sent with every request.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Completes a bare prompt.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete_with_system(None, prompt).await
    }

    /// Completes a prompt with an optional system instruction.
    pub async fn complete_with_system(
        &self,
        system: Option<&str>,
        prompt: &str,
    ) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));

        let mut request = GenerationRequest::new(self.model.clone(), messages);
        if let Some(t) = self.temperature {
            request = request.with_temperature(t);
        }
        if let Some(m) = self.max_tokens {
            request = request.with_max_tokens(m);
        }

        self.execute_with_retry(request).await
    }

    async fn execute_with_retry(&self, request: GenerationRequest) -> Result<String, LlmError> {
        let mut last_error: Option<LlmError> = None;

        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying completion after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.execute_once(request.clone()).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "Transient completion failure"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let last = last_error
            .unwrap_or_else(|| LlmError::RequestFailed("no attempt was made".to_string()));
        Err(LlmError::RetriesExhausted {
            attempts: self.policy.max_attempts,
            last: Box::new(last),
        })
    }

    async fn execute_once(&self, request: GenerationRequest) -> Result<String, LlmError> {
        let timeout = self.policy.attempt_timeout;
        let response = tokio::time::timeout(timeout, self.provider.generate(request))
            .await
            .map_err(|_| LlmError::Timeout {
                millis: timeout.as_millis() as u64,
            })??;

        response
            .first_content()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LlmError::ParseError("Empty LLM response".to_string()))
    }
}
