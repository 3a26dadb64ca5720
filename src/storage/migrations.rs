//! Schema migrations.
//!
//! Each entry of [`schema::MIGRATIONS`] is applied at most once, in a single
//! transaction, and recorded by name in `_migrations`. Opening an up-to-date
//! database applies nothing.

use sqlx::SqlitePool;
use thiserror::Error;

use super::schema::{self, Migration};

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A statement of the named migration failed; nothing of it was kept.
    #[error("Migration {name} failed: {message}")]
    MigrationFailed { name: String, message: String },
}

/// Applies pending schema migrations to a pool.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Applies every migration not yet recorded, oldest first.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        self.ensure_migrations_table().await?;
        let applied = self.list_applied_migrations().await?;

        for migration in schema::MIGRATIONS {
            if applied.iter().any(|name| name == migration.name) {
                continue;
            }
            self.apply(migration).await?;
            tracing::info!(migration = migration.name, "Applied schema migration");
        }
        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| MigrationError::MigrationFailed {
                    name: migration.name.to_string(),
                    message: e.to_string(),
                })?;
        }
        sqlx::query("INSERT INTO _migrations (name) VALUES (?1)")
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Names of applied migrations, oldest first.
    pub async fn list_applied_migrations(&self) -> Result<Vec<String>, MigrationError> {
        self.ensure_migrations_table().await?;

        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM _migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().map(|(n,)| n).collect())
    }
}
