//! LLM integration for prompt-forge.
//!
//! [`LlmProvider`] is the seam every component talks to. [`LiteLlmClient`]
//! implements it against any OpenAI-compatible `/chat/completions` endpoint
//! (LiteLLM proxy, OpenRouter). [`Completer`] wraps a provider with per-call
//! timeouts and a bounded retry budget.
//!
//! ```ignore
//! use prompt_forge::llm::{Completer, LiteLlmClient, RetryPolicy};
//! use std::sync::Arc;
//!
//! let client = LiteLlmClient::openrouter(std::env::var("OPENROUTER_API_KEY")?);
//! let completer = Completer::new(Arc::new(client), RetryPolicy::default())
//!     .with_temperature(0.7);
//! let text = completer.complete("Say hello").await?;
//! ```

pub mod completion;
pub mod litellm;

pub use completion::{Completer, RetryPolicy};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Role,
    UnconfiguredProvider, Usage, DEFAULT_MODEL, OPENROUTER_BASE_URL,
};
