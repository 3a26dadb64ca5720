//! SQLite database client for the prompt history store.
//!
//! Holds projects, their append-only prompt version history, generated test
//! batches and run-scoped evaluation results.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::template::{Bindings, VariableSet};
use crate::types::{
    CaseFailure, CaseFailureKind, EvaluationResult, EvaluationRun, NewPromptVersion, NewTestCase,
    Ordinal, Project, PromptVersion, RunSummary, TestBatch, TestCase,
};

use super::migrations::MigrationRunner;

/// Attempts for an append that loses an ordinal race to another process.
const APPEND_ATTEMPTS: u32 = 3;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Project already exists: {0}")]
    ProjectExists(String),

    #[error("Version {ordinal} not found in project {slug}")]
    VersionNotFound { slug: String, ordinal: Ordinal },
}

impl DatabaseError {
    /// Stable reason code reported to callers.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ProjectNotFound(_) => "project_not_found",
            Self::ProjectExists(_) => "project_exists",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::ConnectionFailed(_)
            | Self::QueryFailed(_)
            | Self::Serialization(_)
            | Self::Migration(_)
            | Self::Corrupt(_) => "storage_unavailable",
        }
    }

    fn is_unique_violation(&self) -> bool {
        match self {
            Self::QueryFailed(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }
}

/// SQLite database client.
///
/// Appends to a project's version history are serialized by a per-project
/// lock; the `UNIQUE(project_slug, ordinal)` constraint backs it up across
/// processes.
pub struct Database {
    pool: SqlitePool,
    append_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Connects to the database, creating the file if needed.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite://prompt_history.db")
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_pool(pool))
    }

    /// Opens a private in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        // Every connection to `:memory:` is a separate database, so the pool
        // must hold exactly one connection for its whole lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self::from_pool(pool);
        db.run_migrations().await?;
        Ok(db)
    }

    /// Opens `database_url` and brings its schema up to date.
    ///
    /// `sqlite::memory:` gets a private single-connection database.
    pub async fn open(database_url: &str) -> Result<Self, DatabaseError> {
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }
        let db = Self::connect(database_url).await?;
        db.run_migrations().await?;
        tracing::debug!(database_url, "Database ready");
        Ok(db)
    }

    /// Creates a new database client from an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Project Operations
    // =========================================================================

    /// Creates a project together with its initial version (ordinal 0).
    ///
    /// Both rows are written in one transaction.
    pub async fn create_project(
        &self,
        slug: &str,
        label: &str,
        initial_template: &str,
    ) -> Result<(Project, PromptVersion), DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT slug FROM projects WHERE slug = ?1")
                .bind(slug)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(DatabaseError::ProjectExists(slug.to_string()));
        }

        sqlx::query("INSERT INTO projects (slug, label, created_at) VALUES (?1, ?2, ?3)")
            .bind(slug)
            .bind(label)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                let err = DatabaseError::from(e);
                if err.is_unique_violation() {
                    DatabaseError::ProjectExists(slug.to_string())
                } else {
                    err
                }
            })?;

        sqlx::query(
            r#"
            INSERT INTO prompt_versions (
                project_slug, ordinal, template, rationale, parent_ordinal, created_at
            ) VALUES (?1, 0, ?2, NULL, NULL, ?3)
            "#,
        )
        .bind(slug)
        .bind(initial_template)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(slug, "Created project");

        Ok((
            Project {
                slug: slug.to_string(),
                label: label.to_string(),
                created_at: now,
            },
            PromptVersion {
                project_slug: slug.to_string(),
                ordinal: 0,
                template: initial_template.to_string(),
                rationale: None,
                parent_ordinal: None,
                created_at: now,
            },
        ))
    }

    /// Retrieves a project by slug.
    pub async fn get_project(&self, slug: &str) -> Result<Project, DatabaseError> {
        let row = sqlx::query("SELECT slug, label, created_at FROM projects WHERE slug = ?1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::ProjectNotFound(slug.to_string()))?;

        Ok(Project {
            slug: row.try_get("slug")?,
            label: row.try_get("label")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Lists all projects, oldest first.
    pub async fn list_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        let rows = sqlx::query("SELECT slug, label, created_at FROM projects ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(Project {
                    slug: row.try_get("slug")?,
                    label: row.try_get("label")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    // =========================================================================
    // Version Operations
    // =========================================================================

    fn append_lock(&self, slug: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .append_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Appends a version to a project's history with ordinal = max + 1.
    ///
    /// Appends for the same project are serialized; different projects never
    /// wait on each other.
    pub async fn append_version(
        &self,
        slug: &str,
        version: NewPromptVersion,
    ) -> Result<PromptVersion, DatabaseError> {
        let lock = self.append_lock(slug);
        let _guard = lock.lock().await;

        let mut attempt = 1;
        loop {
            match self.try_append_version(slug, &version).await {
                Err(err) if err.is_unique_violation() && attempt < APPEND_ATTEMPTS => {
                    tracing::warn!(slug, attempt, "Ordinal collision on append, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_append_version(
        &self,
        slug: &str,
        version: &NewPromptVersion,
    ) -> Result<PromptVersion, DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT slug FROM projects WHERE slug = ?1")
            .bind(slug)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(DatabaseError::ProjectNotFound(slug.to_string()));
        }

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM prompt_versions WHERE project_slug = ?1",
        )
        .bind(slug)
        .fetch_one(&mut *tx)
        .await?;
        let ordinal = ordinal_from_i64(next)?;

        sqlx::query(
            r#"
            INSERT INTO prompt_versions (
                project_slug, ordinal, template, rationale, parent_ordinal, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(slug)
        .bind(i64::from(ordinal))
        .bind(&version.template)
        .bind(&version.rationale)
        .bind(version.parent_ordinal.map(i64::from))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(slug, ordinal, parent = ?version.parent_ordinal, "Appended prompt version");

        Ok(PromptVersion {
            project_slug: slug.to_string(),
            ordinal,
            template: version.template.clone(),
            rationale: version.rationale.clone(),
            parent_ordinal: version.parent_ordinal,
            created_at: now,
        })
    }

    /// Returns the version with the highest ordinal.
    pub async fn latest_version(&self, slug: &str) -> Result<PromptVersion, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT project_slug, ordinal, template, rationale, parent_ordinal, created_at
            FROM prompt_versions
            WHERE project_slug = ?1
            ORDER BY ordinal DESC
            LIMIT 1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => version_from_row(&row),
            None => {
                self.get_project(slug).await?;
                Err(DatabaseError::VersionNotFound {
                    slug: slug.to_string(),
                    ordinal: 0,
                })
            }
        }
    }

    /// Returns a specific version.
    pub async fn get_version(
        &self,
        slug: &str,
        ordinal: Ordinal,
    ) -> Result<PromptVersion, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT project_slug, ordinal, template, rationale, parent_ordinal, created_at
            FROM prompt_versions
            WHERE project_slug = ?1 AND ordinal = ?2
            "#,
        )
        .bind(slug)
        .bind(i64::from(ordinal))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => version_from_row(&row),
            None => {
                self.get_project(slug).await?;
                Err(DatabaseError::VersionNotFound {
                    slug: slug.to_string(),
                    ordinal,
                })
            }
        }
    }

    /// Returns every version of a project, ordered by ordinal ascending.
    pub async fn history(&self, slug: &str) -> Result<Vec<PromptVersion>, DatabaseError> {
        self.get_project(slug).await?;

        let rows = sqlx::query(
            r#"
            SELECT project_slug, ordinal, template, rationale, parent_ordinal, created_at
            FROM prompt_versions
            WHERE project_slug = ?1
            ORDER BY ordinal ASC
            "#,
        )
        .bind(slug)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(version_from_row).collect()
    }

    // =========================================================================
    // Test Case Operations
    // =========================================================================

    /// Persists a whole batch of test cases in one transaction.
    pub async fn save_test_batch(
        &self,
        slug: &str,
        variables: &VariableSet,
        cases: Vec<NewTestCase>,
    ) -> Result<TestBatch, DatabaseError> {
        self.get_project(slug).await?;

        let batch_id = Uuid::new_v4();
        let now = Utc::now();
        let variables_json = serde_json::to_string(variables)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO test_batches (id, project_slug, variables, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(batch_id.to_string())
        .bind(slug)
        .bind(&variables_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut stored = Vec::with_capacity(cases.len());
        for (position, case) in cases.into_iter().enumerate() {
            let case_id = Uuid::new_v4();
            let bindings_json = serde_json::to_string(&case.bindings)?;

            sqlx::query(
                r#"
                INSERT INTO test_cases (
                    id, batch_id, project_slug, position, bindings, expected_output, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(case_id.to_string())
            .bind(batch_id.to_string())
            .bind(slug)
            .bind(position as i64)
            .bind(&bindings_json)
            .bind(&case.expected_output)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            stored.push(TestCase {
                id: case_id,
                project_slug: slug.to_string(),
                batch_id,
                bindings: case.bindings,
                expected_output: case.expected_output,
                created_at: now,
            });
        }

        tx.commit().await?;

        tracing::info!(slug, batch_id = %batch_id, cases = stored.len(), "Saved test batch");

        Ok(TestBatch {
            id: batch_id,
            project_slug: slug.to_string(),
            variables: variables.clone(),
            cases: stored,
            created_at: now,
        })
    }

    /// Returns the most recently generated batch, if any.
    pub async fn latest_batch(&self, slug: &str) -> Result<Option<TestBatch>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM test_batches
            WHERE project_slug = ?1
            ORDER BY rowid DESC
            LIMIT 1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let id = parse_uuid(&row.try_get::<String, _>("id")?)?;
                self.get_batch(id).await
            }
            None => Ok(None),
        }
    }

    /// Returns a batch with its cases in generation order.
    pub async fn get_batch(&self, batch_id: Uuid) -> Result<Option<TestBatch>, DatabaseError> {
        let row = sqlx::query(
            "SELECT id, project_slug, variables, created_at FROM test_batches WHERE id = ?1",
        )
        .bind(batch_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let variables: VariableSet =
            serde_json::from_str(&row.try_get::<String, _>("variables")?)?;

        let case_rows = sqlx::query(
            r#"
            SELECT id, batch_id, project_slug, bindings, expected_output, created_at
            FROM test_cases
            WHERE batch_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let cases = case_rows
            .iter()
            .map(case_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(TestBatch {
            id: batch_id,
            project_slug: row.try_get("project_slug")?,
            variables,
            cases,
            created_at: row.try_get("created_at")?,
        }))
    }

    /// Counts every stored test case of a project, across batches.
    pub async fn count_test_cases(&self, slug: &str) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_cases WHERE project_slug = ?1")
            .bind(slug)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Evaluation Operations
    // =========================================================================

    /// Persists a run and all of its results in one transaction.
    pub async fn save_evaluation_run(&self, run: &EvaluationRun) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO evaluation_runs (
                id, project_slug, version_ordinal, batch_id, pass_threshold, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.project_slug)
        .bind(i64::from(run.version_ordinal))
        .bind(run.batch_id.map(|id| id.to_string()))
        .bind(run.pass_threshold)
        .bind(run.created_at)
        .execute(&mut *tx)
        .await?;

        for (position, result) in run.results.iter().enumerate() {
            let bindings_json = serde_json::to_string(&result.bindings)?;

            sqlx::query(
                r#"
                INSERT INTO evaluation_results (
                    run_id, position, case_id, bindings, expected_output, rendered_prompt,
                    output, score, passed, notes, failure_kind, failure_message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(run.id.to_string())
            .bind(position as i64)
            .bind(result.case_id.to_string())
            .bind(&bindings_json)
            .bind(&result.expected_output)
            .bind(&result.rendered_prompt)
            .bind(&result.output)
            .bind(result.score)
            .bind(result.passed)
            .bind(&result.notes)
            .bind(result.failure.as_ref().map(|f| f.kind.as_str()))
            .bind(result.failure.as_ref().map(|f| f.message.as_str()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            slug = %run.project_slug,
            ordinal = run.version_ordinal,
            run_id = %run.id,
            results = run.results.len(),
            "Saved evaluation run"
        );
        Ok(())
    }

    /// Returns a run with all of its results.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<EvaluationRun>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, project_slug, version_ordinal, batch_id, pass_threshold, created_at
            FROM evaluation_runs
            WHERE id = ?1
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.load_run(&row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Returns the most recent run of a version, optionally restricted to a batch.
    pub async fn latest_run(
        &self,
        slug: &str,
        ordinal: Ordinal,
        batch_id: Option<Uuid>,
    ) -> Result<Option<EvaluationRun>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, project_slug, version_ordinal, batch_id, pass_threshold, created_at
            FROM evaluation_runs
            WHERE project_slug = ?1
              AND version_ordinal = ?2
              AND (?3 IS NULL OR batch_id = ?3)
            ORDER BY rowid DESC
            LIMIT 1
            "#,
        )
        .bind(slug)
        .bind(i64::from(ordinal))
        .bind(batch_id.map(|id| id.to_string()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.load_run(&row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Aggregates of every run of a project, oldest first.
    pub async fn run_summaries(&self, slug: &str) -> Result<Vec<RunSummary>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id AS run_id,
                   r.version_ordinal AS version_ordinal,
                   r.batch_id AS batch_id,
                   r.created_at AS created_at,
                   COALESCE(AVG(e.score), 0.0) AS aggregate_score,
                   COALESCE(SUM(e.passed), 0) AS pass_count,
                   COUNT(e.id) AS total
            FROM evaluation_runs r
            LEFT JOIN evaluation_results e ON e.run_id = r.id
            WHERE r.project_slug = ?1
            GROUP BY r.id
            ORDER BY r.rowid ASC
            "#,
        )
        .bind(slug)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let pass_count: i64 = row.try_get("pass_count")?;
                let total: i64 = row.try_get("total")?;
                Ok(RunSummary {
                    run_id: parse_uuid(&row.try_get::<String, _>("run_id")?)?,
                    version_ordinal: ordinal_from_i64(row.try_get("version_ordinal")?)?,
                    batch_id: parse_optional_uuid(row.try_get("batch_id")?)?,
                    aggregate_score: row.try_get("aggregate_score")?,
                    pass_count: pass_count.max(0) as usize,
                    fail_count: (total - pass_count).max(0) as usize,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn load_run(&self, row: &SqliteRow) -> Result<EvaluationRun, DatabaseError> {
        let id_text: String = row.try_get("id")?;
        let run_id = parse_uuid(&id_text)?;
        let version_ordinal = ordinal_from_i64(row.try_get("version_ordinal")?)?;

        let result_rows = sqlx::query(
            r#"
            SELECT case_id, bindings, expected_output, rendered_prompt, output,
                   score, passed, notes, failure_kind, failure_message
            FROM evaluation_results
            WHERE run_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(&id_text)
        .fetch_all(&self.pool)
        .await?;

        let results = result_rows
            .iter()
            .map(|r| result_from_row(r, run_id, version_ordinal))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EvaluationRun {
            id: run_id,
            project_slug: row.try_get("project_slug")?,
            version_ordinal,
            batch_id: parse_optional_uuid(row.try_get("batch_id")?)?,
            pass_threshold: row.try_get("pass_threshold")?,
            results,
            created_at: row.try_get("created_at")?,
        })
    }
}

// =========================================================================
// Row decoding
// =========================================================================

fn parse_uuid(text: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(text).map_err(|e| DatabaseError::Corrupt(format!("uuid '{}': {}", text, e)))
}

fn parse_optional_uuid(text: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    text.as_deref().map(parse_uuid).transpose()
}

fn ordinal_from_i64(value: i64) -> Result<Ordinal, DatabaseError> {
    Ordinal::try_from(value)
        .map_err(|_| DatabaseError::Corrupt(format!("ordinal out of range: {}", value)))
}

fn version_from_row(row: &SqliteRow) -> Result<PromptVersion, DatabaseError> {
    let parent: Option<i64> = row.try_get("parent_ordinal")?;
    Ok(PromptVersion {
        project_slug: row.try_get("project_slug")?,
        ordinal: ordinal_from_i64(row.try_get("ordinal")?)?,
        template: row.try_get("template")?,
        rationale: row.try_get("rationale")?,
        parent_ordinal: parent.map(ordinal_from_i64).transpose()?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn case_from_row(row: &SqliteRow) -> Result<TestCase, DatabaseError> {
    let bindings: Bindings = serde_json::from_str(&row.try_get::<String, _>("bindings")?)?;
    Ok(TestCase {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        project_slug: row.try_get("project_slug")?,
        batch_id: parse_uuid(&row.try_get::<String, _>("batch_id")?)?,
        bindings,
        expected_output: row.try_get("expected_output")?,
        created_at: row.try_get("created_at")?,
    })
}

fn result_from_row(
    row: &SqliteRow,
    run_id: Uuid,
    version_ordinal: Ordinal,
) -> Result<EvaluationResult, DatabaseError> {
    let bindings: Bindings = serde_json::from_str(&row.try_get::<String, _>("bindings")?)?;
    let failure_kind: Option<String> = row.try_get("failure_kind")?;
    let failure = match failure_kind {
        Some(kind) => {
            let kind = CaseFailureKind::parse(&kind)
                .ok_or_else(|| DatabaseError::Corrupt(format!("failure kind '{}'", kind)))?;
            let message: Option<String> = row.try_get("failure_message")?;
            Some(CaseFailure {
                kind,
                message: message.unwrap_or_default(),
            })
        }
        None => None,
    };

    Ok(EvaluationResult {
        run_id,
        version_ordinal,
        case_id: parse_uuid(&row.try_get::<String, _>("case_id")?)?,
        bindings,
        expected_output: row.try_get("expected_output")?,
        rendered_prompt: row.try_get("rendered_prompt")?,
        output: row.try_get("output")?,
        score: row.try_get("score")?,
        passed: row.try_get("passed")?,
        notes: row.try_get("notes")?,
        failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db_with_project(slug: &str) -> Database {
        let db = Database::in_memory().await.unwrap();
        db.create_project(slug, "Test", "Summarize: {{article}}")
            .await
            .unwrap();
        db
    }

    #[test]
    fn test_reasons_are_distinct() {
        let errors = [
            DatabaseError::ProjectNotFound("p".into()),
            DatabaseError::ProjectExists("p".into()),
            DatabaseError::VersionNotFound {
                slug: "p".into(),
                ordinal: 3,
            },
            DatabaseError::ConnectionFailed("down".into()),
        ];
        let reasons: std::collections::HashSet<_> = errors.iter().map(|e| e.reason()).collect();
        assert_eq!(reasons.len(), errors.len());
    }

    #[tokio::test]
    async fn test_create_project_starts_at_ordinal_zero() {
        let db = db_with_project("news").await;
        let latest = db.latest_version("news").await.unwrap();
        assert_eq!(latest.ordinal, 0);
        assert!(latest.rationale.is_none());
        assert!(latest.is_initial());
    }

    #[tokio::test]
    async fn test_create_duplicate_project_fails() {
        let db = db_with_project("news").await;
        let err = db.create_project("news", "Again", "x").await.unwrap_err();
        assert!(matches!(err, DatabaseError::ProjectExists(_)));
    }

    #[tokio::test]
    async fn test_append_increments_ordinal() {
        let db = db_with_project("news").await;
        let v1 = db
            .append_version("news", NewPromptVersion::derived("B {{article}}", "why", 0))
            .await
            .unwrap();
        assert_eq!(v1.ordinal, 1);
        assert_eq!(v1.parent_ordinal, Some(0));

        let history = db.history("news").await.unwrap();
        let ordinals: Vec<_> = history.iter().map(|v| v.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1]);
        assert_eq!(history[1].rationale.as_deref(), Some("why"));
    }

    #[tokio::test]
    async fn test_get_missing_version_fails() {
        let db = db_with_project("news").await;
        let err = db.get_version("news", 7).await.unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::VersionNotFound { ordinal: 7, .. }
        ));
        assert_eq!(err.reason(), "version_not_found");
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let db = Database::in_memory().await.unwrap();
        let err = db.latest_version("ghost").await.unwrap_err();
        assert!(matches!(err, DatabaseError::ProjectNotFound(_)));
        let err = db
            .append_version("ghost", NewPromptVersion::initial("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_round_trip_preserves_order() {
        let db = db_with_project("news").await;
        let vars: VariableSet = ["article".to_string()].into_iter().collect();
        let cases = (0..3)
            .map(|i| NewTestCase {
                bindings: Bindings::new().with("article", format!("story {i}")),
                expected_output: Some(format!("summary {i}")),
            })
            .collect();

        let saved = db.save_test_batch("news", &vars, cases).await.unwrap();
        let loaded = db.latest_batch("news").await.unwrap().unwrap();

        assert_eq!(loaded.id, saved.id);
        assert_eq!(loaded.variables, vars);
        let articles: Vec<_> = loaded
            .cases
            .iter()
            .map(|c| c.bindings.get("article").unwrap().to_string())
            .collect();
        assert_eq!(articles, vec!["story 0", "story 1", "story 2"]);
        assert_eq!(db.count_test_cases("news").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_runs_are_appended_not_overwritten() {
        let db = db_with_project("news").await;
        let case_id = Uuid::new_v4();

        for score in [0.2, 0.9] {
            let run_id = Uuid::new_v4();
            let run = EvaluationRun {
                id: run_id,
                project_slug: "news".into(),
                version_ordinal: 0,
                batch_id: None,
                pass_threshold: 0.85,
                results: vec![EvaluationResult {
                    run_id,
                    version_ordinal: 0,
                    case_id,
                    bindings: Bindings::new().with("article", "a"),
                    expected_output: None,
                    rendered_prompt: "Summarize: a".into(),
                    output: "out".into(),
                    score,
                    passed: score >= 0.85,
                    notes: String::new(),
                    failure: (score < 0.5).then(|| CaseFailure {
                        kind: CaseFailureKind::Timeout,
                        message: "timed out".into(),
                    }),
                }],
                created_at: Utc::now(),
            };
            db.save_evaluation_run(&run).await.unwrap();
        }

        let summaries = db.run_summaries("news").await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert!((summaries[0].aggregate_score - 0.2).abs() < 1e-9);
        assert_eq!(summaries[1].pass_count, 1);

        let latest = db.latest_run("news", 0, None).await.unwrap().unwrap();
        assert!((latest.aggregate_score() - 0.9).abs() < 1e-9);

        let first = db.get_run(summaries[0].run_id).await.unwrap().unwrap();
        let failure = first.results[0].failure.as_ref().unwrap();
        assert_eq!(failure.kind, CaseFailureKind::Timeout);
    }
}
