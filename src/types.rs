//! Core data model of the optimization loop.
//!
//! A [`Project`] owns an append-only sequence of [`PromptVersion`]s and a pool
//! of [`TestCase`]s grouped in batches. Each evaluation produces an
//! [`EvaluationRun`] holding one [`EvaluationResult`] per evaluated case.
//! Every record is immutable once written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::template::{extract_variables, Bindings, VariableSet};

/// Ordinal of a prompt version within its project's history.
pub type Ordinal = u32;

/// A prompt optimization project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Stable identifier used by every request.
    pub slug: String,
    /// Human readable label.
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable prompt version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub project_slug: String,
    /// Position in the project history; the initial prompt is 0.
    pub ordinal: Ordinal,
    pub template: String,
    /// Why this version exists. Absent only for the initial version.
    pub rationale: Option<String>,
    /// Version this one was derived from.
    pub parent_ordinal: Option<Ordinal>,
    pub created_at: DateTime<Utc>,
}

impl PromptVersion {
    /// Variables referenced by this version's template.
    pub fn variables(&self) -> VariableSet {
        extract_variables(&self.template)
    }

    pub fn is_initial(&self) -> bool {
        self.parent_ordinal.is_none() && self.rationale.is_none()
    }
}

/// A version waiting to be appended; the store assigns the ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPromptVersion {
    pub template: String,
    pub rationale: Option<String>,
    pub parent_ordinal: Option<Ordinal>,
}

impl NewPromptVersion {
    /// The first version of a project.
    pub fn initial(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            rationale: None,
            parent_ordinal: None,
        }
    }

    /// A version derived from `parent` for the given reason.
    pub fn derived(
        template: impl Into<String>,
        rationale: impl Into<String>,
        parent: Ordinal,
    ) -> Self {
        Self {
            template: template.into(),
            rationale: Some(rationale.into()),
            parent_ordinal: Some(parent),
        }
    }
}

/// A generated test case that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTestCase {
    pub bindings: Bindings,
    pub expected_output: Option<String>,
}

/// A persisted test case. Cases belong to the project, not to a version, so
/// one batch can be reused to compare versions fairly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub project_slug: String,
    pub batch_id: Uuid,
    pub bindings: Bindings,
    pub expected_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A batch of test cases produced by one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBatch {
    pub id: Uuid,
    pub project_slug: String,
    /// Variables of the template the batch was generated against.
    pub variables: VariableSet,
    pub cases: Vec<TestCase>,
    pub created_at: DateTime<Utc>,
}

/// Why a case failed before or while being scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseFailureKind {
    /// The case does not bind every variable of the template.
    MissingVariable,
    /// The completion call timed out on its last attempt.
    Timeout,
    /// The completion call failed after exhausting its retries.
    CompletionFailed,
    /// The scorer could not produce a score.
    ScoringFailed,
}

impl CaseFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingVariable => "missing_variable",
            Self::Timeout => "timeout",
            Self::CompletionFailed => "completion_failed",
            Self::ScoringFailed => "scoring_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing_variable" => Some(Self::MissingVariable),
            "timeout" => Some(Self::Timeout),
            "completion_failed" => Some(Self::CompletionFailed),
            "scoring_failed" => Some(Self::ScoringFailed),
            _ => None,
        }
    }
}

/// Annotation recorded on a result whose case could not be run normally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFailure {
    pub kind: CaseFailureKind,
    pub message: String,
}

/// Result of running one prompt version against one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub run_id: Uuid,
    pub version_ordinal: Ordinal,
    pub case_id: Uuid,
    /// Copy of the case inputs, so a result stands on its own for critique.
    pub bindings: Bindings,
    pub expected_output: Option<String>,
    /// Empty when rendering failed.
    pub rendered_prompt: String,
    /// Raw model output; empty when the model was not reached.
    pub output: String,
    /// Score in [0, 1].
    pub score: f64,
    pub passed: bool,
    /// Scorer explanation, e.g. "Wrong format; Too brief (3 vs 40)".
    pub notes: String,
    pub failure: Option<CaseFailure>,
}

/// All results of one evaluation of a version against a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub id: Uuid,
    pub project_slug: String,
    pub version_ordinal: Ordinal,
    pub batch_id: Option<Uuid>,
    pub pass_threshold: f64,
    pub results: Vec<EvaluationResult>,
    pub created_at: DateTime<Utc>,
}

impl EvaluationRun {
    /// Mean per-case score; 0 for an empty run.
    pub fn aggregate_score(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().map(|r| r.score).sum::<f64>() / self.results.len() as f64
    }

    pub fn pass_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn fail_count(&self) -> usize {
        self.results.len() - self.pass_count()
    }

    /// Result for a given case, matched by identity.
    pub fn result_for(&self, case_id: Uuid) -> Option<&EvaluationResult> {
        self.results.iter().find(|r| r.case_id == case_id)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id,
            version_ordinal: self.version_ordinal,
            batch_id: self.batch_id,
            aggregate_score: self.aggregate_score(),
            pass_count: self.pass_count(),
            fail_count: self.fail_count(),
            created_at: self.created_at,
        }
    }
}

/// Aggregate view of a run, as listed in version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub version_ordinal: Ordinal,
    pub batch_id: Option<Uuid>,
    pub aggregate_score: f64,
    pub pass_count: usize,
    pub fail_count: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(score: f64, passed: bool) -> EvaluationResult {
        EvaluationResult {
            run_id: Uuid::nil(),
            version_ordinal: 0,
            case_id: Uuid::new_v4(),
            bindings: Bindings::new(),
            expected_output: None,
            rendered_prompt: String::new(),
            output: String::new(),
            score,
            passed,
            notes: String::new(),
            failure: None,
        }
    }

    #[test]
    fn test_run_aggregates() {
        let run = EvaluationRun {
            id: Uuid::new_v4(),
            project_slug: "p".into(),
            version_ordinal: 0,
            batch_id: None,
            pass_threshold: 0.85,
            results: vec![result(1.0, true), result(0.5, false), result(0.0, false)],
            created_at: Utc::now(),
        };
        assert!((run.aggregate_score() - 0.5).abs() < 1e-9);
        assert_eq!(run.pass_count(), 1);
        assert_eq!(run.fail_count(), 2);
        let summary = run.summary();
        assert_eq!(summary.pass_count, 1);
        assert_eq!(summary.run_id, run.id);
    }

    #[test]
    fn test_empty_run_aggregate_is_zero() {
        let run = EvaluationRun {
            id: Uuid::new_v4(),
            project_slug: "p".into(),
            version_ordinal: 0,
            batch_id: None,
            pass_threshold: 0.85,
            results: vec![],
            created_at: Utc::now(),
        };
        assert_eq!(run.aggregate_score(), 0.0);
    }

    #[test]
    fn test_failure_kind_round_trip_names() {
        for kind in [
            CaseFailureKind::MissingVariable,
            CaseFailureKind::Timeout,
            CaseFailureKind::CompletionFailed,
            CaseFailureKind::ScoringFailed,
        ] {
            assert_eq!(CaseFailureKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CaseFailureKind::parse("nope"), None);
    }

    #[test]
    fn test_new_version_constructors() {
        let initial = NewPromptVersion::initial("Summarize: {{article}}");
        assert!(initial.rationale.is_none());
        let derived = NewPromptVersion::derived("Better {{article}}", "tightened", 0);
        assert_eq!(derived.parent_ordinal, Some(0));
        assert_eq!(derived.rationale.as_deref(), Some("tightened"));
    }
}
