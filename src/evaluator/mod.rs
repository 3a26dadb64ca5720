//! Evaluation of a prompt version against a batch of test cases.
//!
//! For every case the version's template is rendered with the case bindings,
//! sent to the model, and the output scored against the case's reference.
//! Cases run concurrently under a bounded semaphore. A case that cannot be
//! rendered, times out, exhausts its retries or cannot be scored still yields
//! a result, with score 0 and a [`CaseFailure`] annotation, so one bad case
//! never aborts the batch.

pub mod scoring;

pub use scoring::{HeuristicScorer, JudgeScorer, Score, ScoreBreakdown, Scorer};

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::llm::Completer;
use crate::storage::{Database, DatabaseError};
use crate::template::{render, VariableSet};
use crate::types::{
    CaseFailure, CaseFailureKind, EvaluationResult, EvaluationRun, PromptVersion, TestCase,
};

/// Default pass boundary for a case score.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.85;

/// Configuration for the evaluator.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// A case passes when its score is at least this value.
    pub pass_threshold: f64,
    /// Maximum cases in flight at once.
    pub max_concurrency: usize,
    /// Temperature for the evaluated completions.
    pub temperature: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            max_concurrency: 3,
            temperature: 0.1,
        }
    }
}

impl EvaluatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }
}

/// Runs prompt versions against test cases and scores the outputs.
#[derive(Clone)]
pub struct Evaluator {
    completer: Completer,
    scorer: Arc<dyn Scorer>,
    config: EvaluatorConfig,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("scorer", &self.scorer.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    pub fn new(completer: Completer, scorer: Arc<dyn Scorer>, config: EvaluatorConfig) -> Self {
        let completer = completer.with_temperature(config.temperature);
        Self {
            completer,
            scorer,
            config,
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn pass_threshold(&self) -> f64 {
        self.config.pass_threshold
    }

    /// Evaluates `version` against `cases` and persists the run.
    pub async fn evaluate(
        &self,
        db: &Database,
        version: &PromptVersion,
        cases: &[TestCase],
        batch_id: Option<Uuid>,
    ) -> Result<EvaluationRun, DatabaseError> {
        let run = self.run(version, cases, batch_id).await;
        db.save_evaluation_run(&run).await?;
        Ok(run)
    }

    /// Evaluates `version` against `cases` without persisting anything.
    ///
    /// Results come back in case order and carry the case id, regardless of
    /// the order in which the model calls complete.
    pub async fn run(
        &self,
        version: &PromptVersion,
        cases: &[TestCase],
        batch_id: Option<Uuid>,
    ) -> EvaluationRun {
        let run_id = Uuid::new_v4();
        let variables = version.variables();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        tracing::info!(
            slug = %version.project_slug,
            ordinal = version.ordinal,
            run_id = %run_id,
            cases = cases.len(),
            scorer = self.scorer.name(),
            "Evaluating prompt version"
        );

        let futures = cases.iter().map(|case| {
            let sem = semaphore.clone();
            let variables = &variables;
            async move {
                let _permit = sem.acquire().await.ok();
                self.evaluate_case(run_id, version, variables, case).await
            }
        });
        let results = futures::future::join_all(futures).await;

        let run = EvaluationRun {
            id: run_id,
            project_slug: version.project_slug.clone(),
            version_ordinal: version.ordinal,
            batch_id,
            pass_threshold: self.config.pass_threshold,
            results,
            created_at: Utc::now(),
        };

        tracing::info!(
            slug = %run.project_slug,
            ordinal = run.version_ordinal,
            run_id = %run.id,
            aggregate = run.aggregate_score(),
            passed = run.pass_count(),
            failed = run.fail_count(),
            "Evaluation complete"
        );
        run
    }

    async fn evaluate_case(
        &self,
        run_id: Uuid,
        version: &PromptVersion,
        variables: &VariableSet,
        case: &TestCase,
    ) -> EvaluationResult {
        let failed = |kind: CaseFailureKind, message: String, rendered: String, output: String| {
            EvaluationResult {
                run_id,
                version_ordinal: version.ordinal,
                case_id: case.id,
                bindings: case.bindings.clone(),
                expected_output: case.expected_output.clone(),
                rendered_prompt: rendered,
                output,
                score: 0.0,
                passed: false,
                notes: message.clone(),
                failure: Some(CaseFailure { kind, message }),
            }
        };

        let report = case.bindings.check(variables);
        if !report.unknown.is_empty() {
            tracing::debug!(
                case_id = %case.id,
                unknown = ?report.unknown,
                "Ignoring bindings the template does not reference"
            );
        }

        let rendered = match render(&version.template, &case.bindings) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::warn!(case_id = %case.id, error = %e, "Case cannot be rendered");
                return failed(
                    CaseFailureKind::MissingVariable,
                    e.to_string(),
                    String::new(),
                    String::new(),
                );
            }
        };

        let output = match self.completer.complete(&rendered).await {
            Ok(output) => output,
            Err(e) => {
                let kind = if e.is_timeout() {
                    CaseFailureKind::Timeout
                } else {
                    CaseFailureKind::CompletionFailed
                };
                tracing::warn!(
                    case_id = %case.id,
                    kind = kind.as_str(),
                    error = %e,
                    "Case completion failed"
                );
                return failed(kind, e.to_string(), rendered, String::new());
            }
        };

        match self
            .scorer
            .score(&output, case.expected_output.as_deref())
            .await
        {
            Ok(score) => {
                tracing::debug!(case_id = %case.id, score = score.value, "Case scored");
                EvaluationResult {
                    run_id,
                    version_ordinal: version.ordinal,
                    case_id: case.id,
                    bindings: case.bindings.clone(),
                    expected_output: case.expected_output.clone(),
                    rendered_prompt: rendered,
                    output,
                    score: score.value,
                    passed: score.value >= self.config.pass_threshold,
                    notes: score.notes,
                    failure: None,
                }
            }
            Err(e) => {
                tracing::warn!(case_id = %case.id, error = %e, "Case scoring failed");
                failed(
                    CaseFailureKind::ScoringFailed,
                    e.to_string(),
                    rendered,
                    output,
                )
            }
        }
    }
}
