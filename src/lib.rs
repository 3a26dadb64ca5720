//! prompt-forge: iterative prompt optimization against generated test cases.
//!
//! This library generates synthetic test cases for a prompt template,
//! evaluates prompt versions against them, asks an LLM for improved versions
//! from the observed failures, and keeps every version in an append-only
//! history on SQLite.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod generator;
pub mod llm;
pub mod optimizer;
pub mod service;
pub mod storage;
pub mod template;
pub mod types;
pub mod utils;

// Re-export commonly used error types
pub use error::{
    ForgeError, ForgeResult, GeneratorError, LlmError, OptimizerError, TemplateError,
};

pub use config::{ConfigError, ForgeConfig, ScorerKind};
pub use service::{Comparison, HistoryEntry, LoopReport, LoopStep, PromptForge, StopReason};
pub use storage::{Database, DatabaseError};
pub use types::{
    CaseFailure, CaseFailureKind, EvaluationResult, EvaluationRun, Ordinal, Project,
    PromptVersion, RunSummary, TestBatch, TestCase,
};
