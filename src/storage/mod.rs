//! SQLite persistent storage for prompt history.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **Database**: projects, append-only prompt versions, test batches and
//!   run-scoped evaluation results
//! - **Migrations**: named schema migrations, each applied once
//!
//! # Usage
//!
//! ```rust,ignore
//! use prompt_forge::storage::Database;
//! use prompt_forge::types::NewPromptVersion;
//!
//! let db = Database::open("sqlite://prompt_history.db").await?;
//!
//! let (project, v0) = db.create_project("news", "News digest", "Summarize: {{article}}").await?;
//! let v1 = db
//!     .append_version("news", NewPromptVersion::derived("Summarize in 3 bullets: {{article}}", "Too verbose", v0.ordinal))
//!     .await?;
//! assert_eq!(db.latest_version("news").await?.ordinal, v1.ordinal);
//! ```

pub mod database;
pub mod migrations;
pub mod schema;

pub use database::{Database, DatabaseError};
pub use migrations::{MigrationError, MigrationRunner};
