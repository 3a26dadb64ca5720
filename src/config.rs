//! Runtime configuration for prompt-forge.
//!
//! Storage location, LLM endpoint, scoring, concurrency and the timeout and
//! retry budgets of every model call site.

use std::time::Duration;

use thiserror::Error;

use crate::error::LlmError;
use crate::evaluator::EvaluatorConfig;
use crate::generator::GeneratorConfig;
use crate::llm::{LiteLlmClient, RetryPolicy, DEFAULT_MODEL, OPENROUTER_BASE_URL};
use crate::optimizer::OptimizerConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Which scorer rates evaluation outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScorerKind {
    /// Token F1 + format + length, no model calls.
    #[default]
    Heuristic,
    /// LLM rubric judgement for correctness.
    Judge,
}

impl std::str::FromStr for ScorerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "heuristic" => Ok(Self::Heuristic),
            "judge" | "llm" => Ok(Self::Judge),
            other => Err(format!("unknown scorer '{}'", other)),
        }
    }
}

/// Configuration for a prompt-forge instance.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    // Storage settings
    /// SQLite connection URL.
    pub database_url: String,

    // LLM settings
    /// OpenAI-compatible endpoint; OpenRouter when unset and a key is present.
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    /// Model that runs prompts, generates cases and proposes rewrites.
    pub model: String,
    /// Model used by the judge scorer; falls back to `model`.
    pub judge_model: Option<String>,

    // Evaluation settings
    pub scorer: ScorerKind,
    /// A case passes when its score reaches this value.
    pub pass_threshold: f64,
    /// Cases evaluated concurrently.
    pub max_concurrency: usize,
    /// Failing cases included in an optimization critique.
    pub max_critique_cases: usize,

    // Budget settings
    /// Timeout of a single model call attempt.
    pub request_timeout: Duration,
    /// Attempts per model call, first one included.
    pub max_attempts: u32,
    /// First retry delay; doubles on each further attempt.
    pub retry_base_delay: Duration,
    /// Budget of one optimize call, retries included.
    pub optimize_timeout: Duration,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://prompt_history.db".to_string(),

            api_base: None,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            judge_model: None,

            scorer: ScorerKind::Heuristic,
            pass_threshold: 0.85,
            max_concurrency: 3,
            max_critique_cases: 3,

            request_timeout: Duration::from_secs(60),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            optimize_timeout: Duration::from_secs(180),
        }
    }
}

impl ForgeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PROMPT_FORGE_DATABASE_URL`: SQLite URL (default: sqlite://prompt_history.db)
    /// - `LITELLM_API_BASE`: OpenAI-compatible endpoint
    /// - `LITELLM_API_KEY` or `OPENROUTER_API_KEY`: API key
    /// - `LITELLM_DEFAULT_MODEL`: model (default: google/gemini-2.5-flash)
    /// - `PROMPT_FORGE_JUDGE_MODEL`: judge model (default: same as model)
    /// - `PROMPT_FORGE_SCORER`: `heuristic` or `judge` (default: heuristic)
    /// - `PROMPT_FORGE_PASS_THRESHOLD`: pass boundary (default: 0.85)
    /// - `PROMPT_FORGE_MAX_CONCURRENCY`: concurrent cases (default: 3)
    /// - `PROMPT_FORGE_REQUEST_TIMEOUT_SECS`: per-attempt timeout (default: 60)
    /// - `PROMPT_FORGE_MAX_ATTEMPTS`: attempts per call (default: 3)
    /// - `PROMPT_FORGE_RETRY_BASE_DELAY_MS`: first backoff (default: 1000)
    /// - `PROMPT_FORGE_OPTIMIZE_TIMEOUT_SECS`: optimize budget (default: 180)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PROMPT_FORGE_DATABASE_URL") {
            config.database_url = val;
        }

        // LLM settings
        config.api_base = std::env::var("LITELLM_API_BASE").ok();
        config.api_key = std::env::var("LITELLM_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
        if let Ok(val) = std::env::var("LITELLM_DEFAULT_MODEL") {
            config.model = val;
        }
        config.judge_model = std::env::var("PROMPT_FORGE_JUDGE_MODEL").ok();

        // Evaluation settings
        if let Ok(val) = std::env::var("PROMPT_FORGE_SCORER") {
            config.scorer = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "PROMPT_FORGE_SCORER".to_string(),
                message,
            })?;
        }
        if let Ok(val) = std::env::var("PROMPT_FORGE_PASS_THRESHOLD") {
            config.pass_threshold = parse_env_value(&val, "PROMPT_FORGE_PASS_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("PROMPT_FORGE_MAX_CONCURRENCY") {
            config.max_concurrency = parse_env_value(&val, "PROMPT_FORGE_MAX_CONCURRENCY")?;
        }

        // Budget settings
        if let Ok(val) = std::env::var("PROMPT_FORGE_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PROMPT_FORGE_REQUEST_TIMEOUT_SECS")?;
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PROMPT_FORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "PROMPT_FORGE_MAX_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("PROMPT_FORGE_RETRY_BASE_DELAY_MS") {
            let millis: u64 = parse_env_value(&val, "PROMPT_FORGE_RETRY_BASE_DELAY_MS")?;
            config.retry_base_delay = Duration::from_millis(millis);
        }
        if let Ok(val) = std::env::var("PROMPT_FORGE_OPTIMIZE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PROMPT_FORGE_OPTIMIZE_TIMEOUT_SECS")?;
            config.optimize_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return Err(ConfigError::ValidationFailed(
                "pass_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout.is_zero() || self.optimize_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_judge_model(mut self, model: impl Into<String>) -> Self {
        self.judge_model = Some(model.into());
        self
    }

    pub fn with_scorer(mut self, scorer: ScorerKind) -> Self {
        self.scorer = scorer;
        self
    }

    /// Builder method to set the pass threshold.
    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_max_critique_cases(mut self, max: usize) -> Self {
        self.max_critique_cases = max;
        self
    }

    /// Builder method to set the per-attempt request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_optimize_timeout(mut self, timeout: Duration) -> Self {
        self.optimize_timeout = timeout;
        self
    }

    /// Model used by the judge scorer.
    pub fn judge_model(&self) -> &str {
        self.judge_model.as_deref().unwrap_or(&self.model)
    }

    /// Retry budget shared by every model call site.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.retry_base_delay,
            self.request_timeout,
        )
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::default()
    }

    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig::default()
            .with_pass_threshold(self.pass_threshold)
            .with_max_concurrency(self.max_concurrency)
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig::default()
            .with_max_critique_cases(self.max_critique_cases)
            .with_timeout(self.optimize_timeout)
    }

    /// Builds the HTTP client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiBase` when neither an endpoint nor an API
    /// key is configured.
    pub fn llm_client(&self) -> Result<LiteLlmClient, LlmError> {
        match (&self.api_base, &self.api_key) {
            (Some(base), key) => Ok(LiteLlmClient::new(
                base.clone(),
                key.clone(),
                self.model.clone(),
            )),
            (None, Some(key)) => Ok(LiteLlmClient::new(
                OPENROUTER_BASE_URL.to_string(),
                Some(key.clone()),
                self.model.clone(),
            )),
            (None, None) => Err(LlmError::MissingApiBase),
        }
    }
}

/// Parse an environment variable value into the requested type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
