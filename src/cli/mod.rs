//! Command-line interface for prompt-forge.
//!
//! Thin front-end over [`crate::service::PromptForge`]: project creation,
//! test generation, evaluation, optimization and version history commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
