//! Database schema constants.
//!
//! SQLite DDL for the prompt history store. Identifiers (UUIDs) are stored as
//! text, timestamps as RFC 3339 text, bindings and variable sets as JSON text.

/// SQL schema for creating the projects table.
pub const CREATE_PROJECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    slug TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// SQL schema for creating the prompt_versions table.
///
/// `UNIQUE(project_slug, ordinal)` is the storage-side guard against
/// duplicate ordinals.
pub const CREATE_PROMPT_VERSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS prompt_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_slug TEXT NOT NULL REFERENCES projects(slug) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    template TEXT NOT NULL,
    rationale TEXT,
    parent_ordinal INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE(project_slug, ordinal)
)
"#;

/// SQL schema for creating the test_batches table.
pub const CREATE_TEST_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS test_batches (
    id TEXT PRIMARY KEY,
    project_slug TEXT NOT NULL REFERENCES projects(slug) ON DELETE CASCADE,
    variables TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// SQL schema for creating the test_cases table.
pub const CREATE_TEST_CASES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS test_cases (
    id TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL REFERENCES test_batches(id) ON DELETE CASCADE,
    project_slug TEXT NOT NULL REFERENCES projects(slug) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    bindings TEXT NOT NULL,
    expected_output TEXT,
    created_at TEXT NOT NULL
)
"#;

/// SQL schema for creating the evaluation_runs table.
pub const CREATE_EVALUATION_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS evaluation_runs (
    id TEXT PRIMARY KEY,
    project_slug TEXT NOT NULL REFERENCES projects(slug) ON DELETE CASCADE,
    version_ordinal INTEGER NOT NULL,
    batch_id TEXT REFERENCES test_batches(id) ON DELETE SET NULL,
    pass_threshold REAL NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (project_slug, version_ordinal)
        REFERENCES prompt_versions(project_slug, ordinal)
)
"#;

/// SQL schema for creating the evaluation_results table.
pub const CREATE_EVALUATION_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS evaluation_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES evaluation_runs(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    case_id TEXT NOT NULL,
    bindings TEXT NOT NULL,
    expected_output TEXT,
    rendered_prompt TEXT NOT NULL,
    output TEXT NOT NULL,
    score REAL NOT NULL,
    passed INTEGER NOT NULL,
    notes TEXT NOT NULL,
    failure_kind TEXT,
    failure_message TEXT,
    UNIQUE(run_id, case_id)
)
"#;

/// A named group of statements applied in one transaction.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// Schema history, oldest first. Applied migrations are never edited; new
/// schema changes get a new entry.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_version_history",
        statements: &[
            CREATE_PROJECTS_TABLE,
            CREATE_PROMPT_VERSIONS_TABLE,
            "CREATE INDEX IF NOT EXISTS idx_prompt_versions_project ON prompt_versions(project_slug, ordinal)",
        ],
    },
    Migration {
        name: "0002_test_cases",
        statements: &[
            CREATE_TEST_BATCHES_TABLE,
            CREATE_TEST_CASES_TABLE,
            "CREATE INDEX IF NOT EXISTS idx_test_batches_project ON test_batches(project_slug, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_test_cases_batch ON test_cases(batch_id, position)",
        ],
    },
    Migration {
        name: "0003_evaluation_runs",
        statements: &[
            CREATE_EVALUATION_RUNS_TABLE,
            CREATE_EVALUATION_RESULTS_TABLE,
            "CREATE INDEX IF NOT EXISTS idx_evaluation_runs_version ON evaluation_runs(project_slug, version_ordinal, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_evaluation_results_run ON evaluation_results(run_id, position)",
        ],
    },
];

/// Table names in the schema.
pub mod tables {
    pub const PROJECTS: &str = "projects";
    pub const PROMPT_VERSIONS: &str = "prompt_versions";
    pub const TEST_BATCHES: &str = "test_batches";
    pub const TEST_CASES: &str = "test_cases";
    pub const EVALUATION_RUNS: &str = "evaluation_runs";
    pub const EVALUATION_RESULTS: &str = "evaluation_results";
}
