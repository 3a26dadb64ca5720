//! Error types for prompt-forge operations.
//!
//! Defines error types for every subsystem of the optimization loop:
//! - Template parsing and rendering
//! - LLM calls (transport, rate limits, timeouts)
//! - Test case generation
//! - Prompt optimization
//!
//! Storage errors live next to the database client in [`crate::storage`].
//! [`ForgeError`] is the request-level error returned by [`crate::service`];
//! every variant maps to a distinct reason code via [`ForgeError::reason`].

use thiserror::Error;

use crate::storage::DatabaseError;

/// Errors that can occur during template operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Template references variable '{name}' but no binding was provided")]
    MissingVariable { name: String },

    #[error("Template text is empty")]
    EmptyTemplate,
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("No LLM endpoint configured: set LITELLM_API_BASE or an API key")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("LLM call timed out after {millis} ms")]
    Timeout { millis: u64 },

    #[error("LLM call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// Returns true for failures worth retrying: timeouts, transport errors,
    /// rate limits and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::RateLimited(_) | LlmError::Timeout { .. } => {
                true
            }
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }

    /// Returns true if this error (or the last attempt behind it) was a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            LlmError::Timeout { .. } => true,
            LlmError::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

/// Errors that can occur during test case generation.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Template has no variables; there is nothing to vary")]
    NoVariables,

    #[error("Invalid case count {0}: at least one test case must be requested")]
    InvalidCount(usize),

    #[error("Test case generation failed: {0}")]
    GenerationFailed(String),

    #[error("LLM error during generation: {0}")]
    Llm(#[from] LlmError),
}

/// Errors that can occur while optimizing a prompt version.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("No evaluation results available; evaluate the version before optimizing")]
    InsufficientData,

    #[error("Proposed template dropped required variables: {}", missing.join(", "))]
    VariableLoss { missing: Vec<String> },

    #[error("Optimization timed out after {seconds} seconds")]
    OptimizationTimeout { seconds: u64 },

    #[error("Optimizer proposal rejected: {0}")]
    ProposalRejected(String),

    #[error("LLM error during optimization: {0}")]
    Llm(#[from] LlmError),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Request-level error surfaced to the CLI and any outer API layer.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

impl ForgeError {
    /// Stable, distinct reason code for this failure kind.
    pub fn reason(&self) -> &'static str {
        match self {
            ForgeError::InvalidInput(_) => "invalid_input",
            ForgeError::Template(TemplateError::MissingVariable { .. }) => "missing_variable",
            ForgeError::Template(TemplateError::EmptyTemplate) => "empty_template",
            ForgeError::Generator(GeneratorError::NoVariables) => "no_variables",
            ForgeError::Generator(GeneratorError::InvalidCount(_)) => "invalid_input",
            ForgeError::Generator(GeneratorError::GenerationFailed(_))
            | ForgeError::Generator(GeneratorError::Llm(_)) => "generation_failed",
            ForgeError::Optimizer(OptimizerError::InsufficientData) => "insufficient_data",
            ForgeError::Optimizer(OptimizerError::VariableLoss { .. }) => "variable_loss",
            ForgeError::Optimizer(OptimizerError::OptimizationTimeout { .. }) => {
                "optimization_timeout"
            }
            ForgeError::Optimizer(OptimizerError::ProposalRejected(_)) => "proposal_rejected",
            ForgeError::Optimizer(OptimizerError::Llm(_)) | ForgeError::Llm(_) => {
                "llm_unavailable"
            }
            ForgeError::Optimizer(OptimizerError::Storage(e)) | ForgeError::Storage(e) => {
                e.reason()
            }
        }
    }
}

/// Result alias for request-level operations.
pub type ForgeResult<T> = Result<T, ForgeError>;
