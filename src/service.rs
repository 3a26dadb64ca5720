//! Request surface of prompt-forge.
//!
//! [`PromptForge`] wires the generator, evaluator and optimizer to an
//! explicitly passed [`Database`] handle. Each method is one unit of work from
//! the caller's point of view; composition (optimize then evaluate) happens
//! here or in the caller, never inside the components.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::{ForgeConfig, ScorerKind};
use crate::error::{ForgeError, ForgeResult, OptimizerError};
use crate::evaluator::{Evaluator, HeuristicScorer, JudgeScorer, Scorer};
use crate::generator::TestCaseGenerator;
use crate::llm::{Completer, LlmProvider, UnconfiguredProvider};
use crate::optimizer::Optimizer;
use crate::storage::Database;
use crate::template::{missing_variables, validate_template};
use crate::types::{
    EvaluationRun, NewPromptVersion, Ordinal, Project, PromptVersion, RunSummary, TestBatch,
};

/// Score differences below this are treated as no change.
const SCORE_EPSILON: f64 = 1e-9;

/// A version together with the summary of its most recent run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub version: PromptVersion,
    pub latest_run: Option<RunSummary>,
}

/// Side-by-side view of two versions evaluated on the same batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub project_slug: String,
    pub batch_id: Uuid,
    pub baseline: RunSummary,
    pub candidate: RunSummary,
    /// `candidate - baseline` aggregate score.
    pub delta: f64,
    pub improved_cases: usize,
    pub regressed_cases: usize,
}

/// Why an optimization loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    Regression,
    BudgetExhausted,
}

/// One optimize-then-evaluate step of a loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStep {
    pub iteration: u32,
    pub ordinal: Ordinal,
    pub aggregate_score: f64,
    pub rationale: Option<String>,
}

/// Outcome of [`PromptForge::run_loop`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopReport {
    pub project_slug: String,
    pub starting_ordinal: Ordinal,
    pub starting_score: f64,
    pub steps: Vec<LoopStep>,
    pub stop_reason: StopReason,
    pub best_ordinal: Ordinal,
    pub best_score: f64,
}

/// The prompt optimization service.
pub struct PromptForge {
    db: Arc<Database>,
    generator: TestCaseGenerator,
    evaluator: Evaluator,
    optimizer: Optimizer,
}

impl std::fmt::Debug for PromptForge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptForge")
            .field("evaluator", &self.evaluator)
            .field("optimizer", &self.optimizer)
            .finish_non_exhaustive()
    }
}

impl PromptForge {
    pub fn new(
        db: Arc<Database>,
        generator: TestCaseGenerator,
        evaluator: Evaluator,
        optimizer: Optimizer,
    ) -> Self {
        Self {
            db,
            generator,
            evaluator,
            optimizer,
        }
    }

    /// Builds every component from `config` on top of one provider.
    pub fn from_config(
        db: Arc<Database>,
        provider: Arc<dyn LlmProvider>,
        config: &ForgeConfig,
    ) -> Self {
        let completer = Completer::new(provider, config.retry_policy()).with_model(&config.model);

        let scorer: Arc<dyn Scorer> = match config.scorer {
            ScorerKind::Heuristic => Arc::new(HeuristicScorer),
            ScorerKind::Judge => Arc::new(JudgeScorer::new(
                completer.clone().with_model(config.judge_model()),
            )),
        };

        Self::new(
            db,
            TestCaseGenerator::new(completer.clone(), config.generator_config()),
            Evaluator::new(completer.clone(), scorer, config.evaluator_config()),
            Optimizer::new(completer, config.optimizer_config()),
        )
    }

    /// Opens the configured database and HTTP client.
    pub async fn connect(config: &ForgeConfig) -> ForgeResult<Self> {
        let provider = Arc::new(config.llm_client()?);
        let db = Arc::new(Database::open(&config.database_url).await?);
        Ok(Self::from_config(db, provider, config))
    }

    /// Opens only the configured database. Model calls fail with a missing
    /// endpoint error, so this suits commands that read or append history.
    pub async fn open_offline(config: &ForgeConfig) -> ForgeResult<Self> {
        let db = Arc::new(Database::open(&config.database_url).await?);
        Ok(Self::from_config(db, Arc::new(UnconfiguredProvider), config))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Creates a project whose first version is `initial_prompt`.
    ///
    /// The slug defaults to a slugified `label`.
    pub async fn create_project(
        &self,
        label: &str,
        slug: Option<&str>,
        initial_prompt: &str,
    ) -> ForgeResult<(Project, PromptVersion)> {
        validate_template(initial_prompt)?;

        let label = label.trim();
        if label.is_empty() {
            return Err(ForgeError::InvalidInput(
                "project label cannot be empty".to_string(),
            ));
        }
        let slug = match slug {
            Some(slug) => slugify(slug),
            None => slugify(label),
        };
        if slug.is_empty() {
            return Err(ForgeError::InvalidInput(format!(
                "cannot derive a slug from '{}'",
                label
            )));
        }

        let (project, version) = self.db.create_project(&slug, label, initial_prompt).await?;
        tracing::info!(
            slug = %project.slug,
            variables = ?version.variables(),
            "Created project"
        );
        Ok((project, version))
    }

    pub async fn list_projects(&self) -> ForgeResult<Vec<Project>> {
        Ok(self.db.list_projects().await?)
    }

    /// Latest version of a project.
    pub async fn get_prompt(&self, slug: &str) -> ForgeResult<PromptVersion> {
        Ok(self.db.latest_version(slug).await?)
    }

    pub async fn get_version(&self, slug: &str, ordinal: Ordinal) -> ForgeResult<PromptVersion> {
        Ok(self.db.get_version(slug, ordinal).await?)
    }

    /// Generates a new batch of test cases for the latest version.
    ///
    /// The batch is persisted as a whole or not at all.
    pub async fn generate_data(&self, slug: &str, num_cases: usize) -> ForgeResult<TestBatch> {
        if num_cases == 0 {
            return Err(ForgeError::InvalidInput(
                "at least one test case must be requested".to_string(),
            ));
        }

        let version = self.db.latest_version(slug).await?;
        let cases = self.generator.generate(&version.template, num_cases).await?;
        let batch = self
            .db
            .save_test_batch(slug, &version.variables(), cases)
            .await?;

        tracing::info!(
            slug,
            batch_id = %batch.id,
            cases = batch.cases.len(),
            "Stored test batch"
        );
        Ok(batch)
    }

    /// Evaluates the latest version against the latest batch.
    pub async fn evaluate(&self, slug: &str) -> ForgeResult<EvaluationRun> {
        let version = self.db.latest_version(slug).await?;
        self.evaluate_on_latest_batch(&version).await
    }

    /// Evaluates a specific version against the latest batch.
    pub async fn evaluate_version(&self, slug: &str, ordinal: Ordinal) -> ForgeResult<EvaluationRun> {
        let version = self.db.get_version(slug, ordinal).await?;
        self.evaluate_on_latest_batch(&version).await
    }

    async fn evaluate_on_latest_batch(&self, version: &PromptVersion) -> ForgeResult<EvaluationRun> {
        let batch = self
            .db
            .latest_batch(&version.project_slug)
            .await?
            .ok_or_else(|| {
                ForgeError::InvalidInput(format!(
                    "project '{}' has no test cases; generate data first",
                    version.project_slug
                ))
            })?;

        Ok(self
            .evaluator
            .evaluate(&self.db, version, &batch.cases, Some(batch.id))
            .await?)
    }

    /// Optimizes the best scoring version on the latest batch.
    ///
    /// The latest version is evaluated first when it has no run on that
    /// batch. The base is the version with the highest aggregate score there
    /// (the newer one on ties), so a regressed version is kept in history but
    /// not built upon. The new version records the base as its parent and is
    /// not evaluated.
    pub async fn optimize(&self, slug: &str) -> ForgeResult<PromptVersion> {
        let latest = self.db.latest_version(slug).await?;
        let batch = self
            .db
            .latest_batch(slug)
            .await?
            .ok_or(OptimizerError::InsufficientData)?;

        if self
            .db
            .latest_run(slug, latest.ordinal, Some(batch.id))
            .await?
            .is_none()
        {
            tracing::info!(slug, ordinal = latest.ordinal, "Results stale, evaluating first");
            self.evaluator
                .evaluate(&self.db, &latest, &batch.cases, Some(batch.id))
                .await?;
        }

        let (base, run) = self.best_on_batch(slug, &batch).await?;
        if base.ordinal != latest.ordinal {
            tracing::info!(
                slug,
                base = base.ordinal,
                latest = latest.ordinal,
                score = run.aggregate_score(),
                "Optimizing from best scoring version"
            );
        }

        Ok(self
            .optimizer
            .optimize(&self.db, &base, &batch.variables, &run.results)
            .await?)
    }

    /// Version with the highest aggregate score on `batch`, with its run.
    async fn best_on_batch(
        &self,
        slug: &str,
        batch: &TestBatch,
    ) -> ForgeResult<(PromptVersion, EvaluationRun)> {
        let mut best: Option<RunSummary> = None;
        for summary in self.db.run_summaries(slug).await? {
            if summary.batch_id != Some(batch.id) {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    summary.aggregate_score > current.aggregate_score + SCORE_EPSILON
                        || ((summary.aggregate_score - current.aggregate_score).abs()
                            <= SCORE_EPSILON
                            && summary.version_ordinal >= current.version_ordinal)
                }
            };
            if better {
                best = Some(summary);
            }
        }

        let best = best.ok_or(OptimizerError::InsufficientData)?;
        let version = self.db.get_version(slug, best.version_ordinal).await?;
        let run = self
            .db
            .get_run(best.run_id)
            .await?
            .ok_or(OptimizerError::InsufficientData)?;
        Ok((version, run))
    }

    /// Every version, oldest first, with its latest run summary.
    pub async fn history(&self, slug: &str) -> ForgeResult<Vec<HistoryEntry>> {
        let versions = self.db.history(slug).await?;
        let summaries = self.db.run_summaries(slug).await?;

        Ok(versions
            .into_iter()
            .map(|version| {
                let latest_run = summaries
                    .iter()
                    .rev()
                    .find(|s| s.version_ordinal == version.ordinal)
                    .cloned();
                HistoryEntry {
                    version,
                    latest_run,
                }
            })
            .collect())
    }

    /// Compares the latest runs of two versions on the latest batch.
    pub async fn compare(
        &self,
        slug: &str,
        baseline: Ordinal,
        candidate: Ordinal,
    ) -> ForgeResult<Comparison> {
        self.db.get_version(slug, baseline).await?;
        self.db.get_version(slug, candidate).await?;

        let batch = self.db.latest_batch(slug).await?.ok_or_else(|| {
            ForgeError::InvalidInput(format!("project '{}' has no test cases", slug))
        })?;

        let mut runs = Vec::with_capacity(2);
        for ordinal in [baseline, candidate] {
            let run = self
                .db
                .latest_run(slug, ordinal, Some(batch.id))
                .await?
                .ok_or_else(|| {
                    ForgeError::InvalidInput(format!(
                        "version v{} has not been evaluated on the latest batch",
                        ordinal
                    ))
                })?;
            runs.push(run);
        }
        let (base_run, cand_run) = (&runs[0], &runs[1]);

        let mut improved_cases = 0;
        let mut regressed_cases = 0;
        for base in &base_run.results {
            if let Some(cand) = cand_run.result_for(base.case_id) {
                if cand.score > base.score + SCORE_EPSILON {
                    improved_cases += 1;
                } else if cand.score + SCORE_EPSILON < base.score {
                    regressed_cases += 1;
                }
            }
        }

        let baseline = base_run.summary();
        let candidate = cand_run.summary();
        Ok(Comparison {
            project_slug: slug.to_string(),
            batch_id: batch.id,
            delta: candidate.aggregate_score - baseline.aggregate_score,
            baseline,
            candidate,
            improved_cases,
            regressed_cases,
        })
    }

    /// Appends a copy of version `ordinal` as the newest version.
    ///
    /// Fails with a variable loss when the copy would not reference every
    /// variable of the latest test batch.
    pub async fn rollback(&self, slug: &str, ordinal: Ordinal) -> ForgeResult<PromptVersion> {
        let target = self.db.get_version(slug, ordinal).await?;
        let latest = self.db.latest_version(slug).await?;

        if let Some(batch) = self.db.latest_batch(slug).await? {
            let missing = missing_variables(&batch.variables, &target.template);
            if !missing.is_empty() {
                tracing::warn!(
                    slug,
                    to = ordinal,
                    missing = ?missing,
                    "Rollback would drop test case variables"
                );
                return Err(OptimizerError::VariableLoss { missing }.into());
            }
        }

        let version = self
            .db
            .append_version(
                slug,
                NewPromptVersion::derived(
                    target.template,
                    format!("Rolled back to v{}", ordinal),
                    latest.ordinal,
                ),
            )
            .await?;

        tracing::info!(slug, from = latest.ordinal, to = ordinal, ordinal = version.ordinal, "Rolled back");
        Ok(version)
    }

    /// Alternates optimize and evaluate until `target` is reached, a step
    /// regresses, or `max_iterations` optimizations have run.
    pub async fn run_loop(
        &self,
        slug: &str,
        target: f64,
        max_iterations: u32,
    ) -> ForgeResult<LoopReport> {
        if !(0.0..=1.0).contains(&target) {
            return Err(ForgeError::InvalidInput(format!(
                "target score {} is outside [0, 1]",
                target
            )));
        }
        if max_iterations == 0 {
            return Err(ForgeError::InvalidInput(
                "max_iterations must be greater than 0".to_string(),
            ));
        }

        let version = self.db.latest_version(slug).await?;
        let batch = self.db.latest_batch(slug).await?.ok_or_else(|| {
            ForgeError::InvalidInput(format!("project '{}' has no test cases", slug))
        })?;
        let run = match self
            .db
            .latest_run(slug, version.ordinal, Some(batch.id))
            .await?
        {
            Some(run) => run,
            None => self.evaluate_on_latest_batch(&version).await?,
        };

        let starting_score = run.aggregate_score();
        let mut report = LoopReport {
            project_slug: slug.to_string(),
            starting_ordinal: version.ordinal,
            starting_score,
            steps: Vec::new(),
            stop_reason: StopReason::BudgetExhausted,
            best_ordinal: version.ordinal,
            best_score: starting_score,
        };

        if starting_score >= target {
            report.stop_reason = StopReason::TargetReached;
            return Ok(report);
        }

        let mut previous = starting_score;
        for iteration in 1..=max_iterations {
            let candidate = self.optimize(slug).await?;
            let run = self.evaluate_on_latest_batch(&candidate).await?;
            let score = run.aggregate_score();

            tracing::info!(
                slug,
                iteration,
                ordinal = candidate.ordinal,
                score,
                previous,
                "Loop step complete"
            );
            report.steps.push(LoopStep {
                iteration,
                ordinal: candidate.ordinal,
                aggregate_score: score,
                rationale: candidate.rationale.clone(),
            });

            if score > report.best_score {
                report.best_score = score;
                report.best_ordinal = candidate.ordinal;
            }
            if score >= target {
                report.stop_reason = StopReason::TargetReached;
                break;
            }
            if score + SCORE_EPSILON < previous {
                tracing::warn!(slug, ordinal = candidate.ordinal, score, previous, "Score regressed");
                report.stop_reason = StopReason::Regression;
                break;
            }
            if (score - previous).abs() <= SCORE_EPSILON {
                tracing::warn!(slug, ordinal = candidate.ordinal, score, "Score stagnated");
            }
            previous = score;
        }

        Ok(report)
    }
}

/// Lowercase ASCII alphanumerics joined by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{GenerationRequest, GenerationResponse, Role};
    use crate::template::Bindings;
    use crate::types::{EvaluationResult, NewTestCase};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    /// Answers generation and optimization requests with canned JSON and
    /// otherwise echoes the text after the first colon of the prompt.
    struct ScriptedProvider;

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            let system = request
                .messages
                .iter()
                .find(|m| m.role == Role::System)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let prompt = request.last_user_content().unwrap_or_default().to_string();

            let content = if system.contains("red teamer") {
                r#"[{"article": "alpha beta gamma", "expected_output": "alpha beta gamma"},
                    {"article": "delta epsilon", "expected_output": "delta epsilon"}]"#
                    .to_string()
            } else if system.contains("prompt engineer") {
                r#"{"improved_prompt": "Repeat exactly: {{article}}", "rationale": "Echo the article"}"#
                    .to_string()
            } else if let Some(rest) = prompt.strip_prefix("Repeat exactly: ") {
                rest.to_string()
            } else {
                "I cannot summarize this".to_string()
            };
            Ok(GenerationResponse::from_text("scripted", content))
        }
    }

    async fn forge() -> PromptForge {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let config = ForgeConfig::new()
            .with_retry_base_delay(Duration::from_millis(1))
            .with_request_timeout(Duration::from_secs(2));
        PromptForge::from_config(db, Arc::new(ScriptedProvider), &config)
    }

    /// Stores a batch whose cases bind both `article` and `audience`.
    async fn audience_batch(forge: &PromptForge, slug: &str) -> TestBatch {
        let variables = ["article".to_string(), "audience".to_string()]
            .into_iter()
            .collect();
        let cases = ["alpha beta gamma", "delta epsilon"]
            .into_iter()
            .map(|article| NewTestCase {
                bindings: Bindings::new()
                    .with("article", article)
                    .with("audience", "engineers"),
                expected_output: Some(article.to_string()),
            })
            .collect();
        forge
            .database()
            .save_test_batch(slug, &variables, cases)
            .await
            .unwrap()
    }

    /// Records a run of `ordinal` on `batch` in which every case scored `score`.
    async fn record_run(forge: &PromptForge, batch: &TestBatch, ordinal: Ordinal, score: f64) {
        let id = Uuid::new_v4();
        let results = batch
            .cases
            .iter()
            .map(|case| EvaluationResult {
                run_id: id,
                version_ordinal: ordinal,
                case_id: case.id,
                bindings: case.bindings.clone(),
                expected_output: case.expected_output.clone(),
                rendered_prompt: String::new(),
                output: "stored output".to_string(),
                score,
                passed: score >= 0.85,
                notes: String::new(),
                failure: None,
            })
            .collect();
        let run = EvaluationRun {
            id,
            project_slug: batch.project_slug.clone(),
            version_ordinal: ordinal,
            batch_id: Some(batch.id),
            pass_threshold: 0.85,
            results,
            created_at: Utc::now(),
        };
        forge.database().save_evaluation_run(&run).await.unwrap();
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Release Notes  Summarizer!"), "release-notes-summarizer");
        assert_eq!(slugify("  --Hello__World-- "), "hello-world");
        assert_eq!(slugify("???"), "");
    }

    #[tokio::test]
    async fn test_create_project_rejects_empty_template() {
        let forge = forge().await;
        let err = forge.create_project("Empty", None, "   ").await.unwrap_err();
        assert_eq!(err.reason(), "empty_template");
        assert!(forge.list_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_and_get_prompt() {
        let forge = forge().await;
        let (project, v0) = forge
            .create_project("News Digest", None, "Summarize: {{article}}")
            .await
            .unwrap();
        assert_eq!(project.slug, "news-digest");
        assert_eq!(v0.ordinal, 0);

        let latest = forge.get_prompt("news-digest").await.unwrap();
        assert_eq!(latest.template, "Summarize: {{article}}");

        let err = forge
            .create_project("News Digest", None, "Other {{x}}")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "project_exists");
    }

    #[tokio::test]
    async fn test_generate_zero_cases_is_input_error() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();

        let err = forge.generate_data("p", 0).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
        assert_eq!(forge.database().count_test_cases("p").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evaluate_without_batch_is_input_error() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        let err = forge.evaluate("p").await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");

        let err = forge.optimize("p").await.unwrap_err();
        assert_eq!(err.reason(), "insufficient_data");
    }

    #[tokio::test]
    async fn test_optimize_evaluates_stale_version_first() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        forge.generate_data("p", 2).await.unwrap();

        let v1 = forge.optimize("p").await.unwrap();
        assert_eq!(v1.ordinal, 1);
        assert_eq!(v1.parent_ordinal, Some(0));
        assert_eq!(v1.rationale.as_deref(), Some("Echo the article"));

        let history = forge.history("p").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].latest_run.is_some());
        assert!(history[1].latest_run.is_none());
    }

    #[tokio::test]
    async fn test_compare_and_rollback() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        forge.generate_data("p", 2).await.unwrap();
        forge.optimize("p").await.unwrap();
        forge.evaluate("p").await.unwrap();

        let cmp = forge.compare("p", 0, 1).await.unwrap();
        assert!(cmp.delta > 0.0);
        assert_eq!(cmp.improved_cases, 2);
        assert_eq!(cmp.regressed_cases, 0);

        let v2 = forge.rollback("p", 0).await.unwrap();
        assert_eq!(v2.ordinal, 2);
        assert_eq!(v2.template, "Summarize: {{article}}");
        assert_eq!(v2.rationale.as_deref(), Some("Rolled back to v0"));
        assert_eq!(v2.parent_ordinal, Some(1));

        let err = forge.rollback("p", 9).await.unwrap_err();
        assert_eq!(err.reason(), "version_not_found");
    }

    #[tokio::test]
    async fn test_rollback_cannot_drop_batch_variables() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        forge
            .database()
            .append_version(
                "p",
                NewPromptVersion::derived("Summarize {{article}} for {{audience}}", "Add audience", 0),
            )
            .await
            .unwrap();
        audience_batch(&forge, "p").await;

        let err = forge.rollback("p", 0).await.unwrap_err();
        assert_eq!(err.reason(), "variable_loss");
        assert!(err.to_string().contains("audience"));
        assert_eq!(forge.history("p").await.unwrap().len(), 2);

        let v2 = forge.rollback("p", 1).await.unwrap();
        assert_eq!(v2.ordinal, 2);
        assert!(v2.variables().contains("audience"));
    }

    #[tokio::test]
    async fn test_optimize_keeps_batch_variables() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        forge
            .database()
            .append_version(
                "p",
                NewPromptVersion::derived("Summarize {{article}} for {{audience}}", "Add audience", 0),
            )
            .await
            .unwrap();
        let batch = audience_batch(&forge, "p").await;
        record_run(&forge, &batch, 0, 0.9).await;
        record_run(&forge, &batch, 1, 0.2).await;

        // v0 scores best but the proposal must still keep {{audience}}.
        let err = forge.optimize("p").await.unwrap_err();
        assert_eq!(err.reason(), "variable_loss");
        assert!(err.to_string().contains("audience"));
        assert_eq!(forge.history("p").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_optimize_builds_on_best_version() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        let batch = forge.generate_data("p", 2).await.unwrap();
        forge
            .database()
            .append_version(
                "p",
                NewPromptVersion::derived("Shout: {{article}}", "Louder", 0),
            )
            .await
            .unwrap();
        record_run(&forge, &batch, 0, 0.6).await;
        record_run(&forge, &batch, 1, 0.3).await;

        let v2 = forge.optimize("p").await.unwrap();
        assert_eq!(v2.ordinal, 2);
        assert_eq!(v2.parent_ordinal, Some(0));
        assert_eq!(forge.history("p").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_optimize_prefers_newer_version_on_ties() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        let batch = forge.generate_data("p", 2).await.unwrap();
        forge
            .database()
            .append_version(
                "p",
                NewPromptVersion::derived("Briefly summarize: {{article}}", "Shorter", 0),
            )
            .await
            .unwrap();
        record_run(&forge, &batch, 0, 0.5).await;
        record_run(&forge, &batch, 1, 0.5).await;

        let v2 = forge.optimize("p").await.unwrap();
        assert_eq!(v2.parent_ordinal, Some(1));
    }

    #[tokio::test]
    async fn test_offline_forge_serves_history_without_endpoint() {
        let config = ForgeConfig::new().with_database_url("sqlite::memory:");
        let err = PromptForge::connect(&config).await.unwrap_err();
        assert_eq!(err.reason(), "llm_unavailable");

        let forge = PromptForge::open_offline(&config).await.unwrap();
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        assert_eq!(forge.list_projects().await.unwrap().len(), 1);
        assert_eq!(forge.history("p").await.unwrap().len(), 1);
        assert_eq!(forge.rollback("p", 0).await.unwrap().ordinal, 1);

        let err = forge.generate_data("p", 2).await.unwrap_err();
        assert_eq!(err.reason(), "generation_failed");
        assert!(err.to_string().contains("No LLM endpoint configured"));
    }

    #[tokio::test]
    async fn test_run_loop_reaches_target() {
        let forge = forge().await;
        forge
            .create_project("P", Some("p"), "Summarize: {{article}}")
            .await
            .unwrap();
        forge.generate_data("p", 2).await.unwrap();

        let report = forge.run_loop("p", 0.9, 3).await.unwrap();
        assert_eq!(report.stop_reason, StopReason::TargetReached);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.best_ordinal, 1);
        assert!(report.best_score > report.starting_score);
    }

    #[tokio::test]
    async fn test_run_loop_validates_arguments() {
        let forge = forge().await;
        assert_eq!(
            forge.run_loop("p", 1.5, 3).await.unwrap_err().reason(),
            "invalid_input"
        );
        assert_eq!(
            forge.run_loop("p", 0.9, 0).await.unwrap_err().reason(),
            "invalid_input"
        );
    }
}
