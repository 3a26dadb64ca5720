//! Failure-driven prompt optimization.
//!
//! The optimizer turns the results of one evaluation run into a critique,
//! asks the model for an improved template plus a rationale, checks that the
//! proposal still references every variable of the base template and of the
//! test batch, and appends it as a new version. It never evaluates the new version; callers
//! compose optimize and evaluate explicitly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OptimizerError;
use crate::llm::Completer;
use crate::storage::Database;
use crate::template::{missing_variables, validate_template, VariableSet};
use crate::types::{EvaluationResult, NewPromptVersion, PromptVersion};
use crate::utils::{extract_json, truncate_chars, JsonShape};

/// System prompt for optimization.
const OPTIMIZER_SYSTEM_PROMPT: &str = r#"You are an expert prompt engineer.
You rewrite prompt templates so they fix observed failures while keeping every template variable.
Template variables use double braces, e.g. {{article}}, and must be kept verbatim.

You MUST respond with ONLY a JSON object in this exact format:
{"improved_prompt": "<the full rewritten template>", "rationale": "<what you changed and why>"}"#;

/// Configuration for the optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Cases included in the critique.
    pub max_critique_cases: usize,
    /// Characters kept from each input and output in the critique.
    pub snippet_chars: usize,
    /// Temperature for proposals.
    pub temperature: f64,
    /// Maximum tokens for the LLM response.
    pub max_tokens: u32,
    /// Budget for the whole proposal call, retries included.
    pub timeout: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_critique_cases: 3,
            snippet_chars: 150,
            temperature: 0.7,
            max_tokens: 4000,
            timeout: Duration::from_secs(180),
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_critique_cases(mut self, max: usize) -> Self {
        self.max_critique_cases = max.max(1);
        self
    }

    pub fn with_snippet_chars(mut self, chars: usize) -> Self {
        self.snippet_chars = chars;
        self
    }

    /// Sets the temperature for LLM generation.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One entry of the critique sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CritiqueEntry {
    pub input_snippet: String,
    pub expected_output: Option<String>,
    pub actual_output: String,
    pub score: f64,
    pub error_analysis: String,
}

/// A validated proposal, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub template: String,
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
struct ProposalResponse {
    #[serde(default)]
    improved_prompt: String,
    #[serde(default)]
    rationale: String,
}

/// Proposes and stores improved prompt versions.
#[derive(Debug, Clone)]
pub struct Optimizer {
    completer: Completer,
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(completer: Completer, config: OptimizerConfig) -> Self {
        let completer = completer
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens);
        Self { completer, config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Proposes an improvement of `version` and appends it to the history.
    ///
    /// The new version records `version` as its parent and carries the
    /// model's rationale verbatim.
    pub async fn optimize(
        &self,
        db: &Database,
        version: &PromptVersion,
        batch_variables: &VariableSet,
        results: &[EvaluationResult],
    ) -> Result<PromptVersion, OptimizerError> {
        let proposal = self.propose(version, batch_variables, results).await?;

        let new_version = db
            .append_version(
                &version.project_slug,
                NewPromptVersion::derived(proposal.template, proposal.rationale, version.ordinal),
            )
            .await?;

        tracing::info!(
            slug = %new_version.project_slug,
            parent = version.ordinal,
            ordinal = new_version.ordinal,
            "Stored optimized version"
        );
        Ok(new_version)
    }

    /// Asks the model for an improved template and validates it.
    ///
    /// The proposal must reference every variable of `version` and every
    /// variable the test cases were generated against.
    pub async fn propose(
        &self,
        version: &PromptVersion,
        batch_variables: &VariableSet,
        results: &[EvaluationResult],
    ) -> Result<Proposal, OptimizerError> {
        if results.is_empty() {
            return Err(OptimizerError::InsufficientData);
        }

        let mut required = version.variables();
        required.extend(batch_variables.iter().cloned());

        let failing = results.iter().filter(|r| !r.passed).count();
        let critique = self.build_critique(results);
        let prompt = build_optimizer_prompt(&version.template, &required, &critique)?;

        tracing::info!(
            slug = %version.project_slug,
            ordinal = version.ordinal,
            failing,
            passing = results.len() - failing,
            critique_cases = critique.len(),
            "Requesting optimized prompt"
        );

        let call = self
            .completer
            .complete_with_system(Some(OPTIMIZER_SYSTEM_PROMPT), &prompt);
        let response = match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(OptimizerError::OptimizationTimeout {
                    seconds: self.config.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(OptimizerError::Llm(e)),
            Err(_) => {
                return Err(OptimizerError::OptimizationTimeout {
                    seconds: self.config.timeout.as_secs(),
                })
            }
        };

        let proposal = parse_proposal(&response)?;

        let missing = missing_variables(&required, &proposal.template);
        if !missing.is_empty() {
            tracing::warn!(
                slug = %version.project_slug,
                ordinal = version.ordinal,
                missing = ?missing,
                "Proposal dropped required variables"
            );
            return Err(OptimizerError::VariableLoss { missing });
        }

        if proposal.template.trim() == version.template.trim() {
            tracing::warn!(
                slug = %version.project_slug,
                ordinal = version.ordinal,
                "Proposal is identical to the current template"
            );
        }

        Ok(proposal)
    }

    /// Failing cases, worst first; the lowest scoring cases when nothing fails.
    pub fn build_critique(&self, results: &[EvaluationResult]) -> Vec<CritiqueEntry> {
        let mut failing: Vec<&EvaluationResult> = results.iter().filter(|r| !r.passed).collect();
        if failing.is_empty() {
            failing = results.iter().collect();
        }
        failing.sort_by(|a, b| a.score.total_cmp(&b.score));

        let chars = self.config.snippet_chars;
        failing
            .into_iter()
            .take(self.config.max_critique_cases)
            .map(|r| {
                let inputs = serde_json::to_string(&r.bindings).unwrap_or_default();
                CritiqueEntry {
                    input_snippet: truncate_chars(&inputs, chars),
                    expected_output: r.expected_output.as_deref().map(|e| truncate_chars(e, chars)),
                    actual_output: truncate_chars(&r.output, chars),
                    score: r.score,
                    error_analysis: r.notes.clone(),
                }
            })
            .collect()
    }
}

fn build_optimizer_prompt(
    template: &str,
    required: &VariableSet,
    critique: &[CritiqueEntry],
) -> Result<String, OptimizerError> {
    let required = required
        .iter()
        .map(|name| format!("{{{{{}}}}}", name))
        .collect::<Vec<_>>()
        .join(", ");
    let required = if required.is_empty() {
        "(none)".to_string()
    } else {
        required
    };
    let critique_json = serde_json::to_string_pretty(critique)
        .map_err(|e| OptimizerError::ProposalRejected(format!("critique encoding: {}", e)))?;

    Ok(format!(
        r#"Base prompt:
"""
{template}
"""

Required variables: {required}

Recent failures:
{critique_json}

Rewrite the base prompt to address the failures while preserving every required variable."#
    ))
}

fn parse_proposal(response: &str) -> Result<Proposal, OptimizerError> {
    let json = extract_json(response, JsonShape::Object)
        .map_err(|e| OptimizerError::ProposalRejected(e.to_string()))?;
    let parsed: ProposalResponse = serde_json::from_str(&json)
        .map_err(|e| OptimizerError::ProposalRejected(format!("invalid proposal JSON: {}", e)))?;

    if validate_template(&parsed.improved_prompt).is_err() {
        return Err(OptimizerError::ProposalRejected(
            "proposal has an empty template".to_string(),
        ));
    }
    let rationale = parsed.rationale.trim();
    if rationale.is_empty() {
        return Err(OptimizerError::ProposalRejected(
            "proposal has no rationale".to_string(),
        ));
    }

    Ok(Proposal {
        template: parsed.improved_prompt,
        rationale: rationale.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider, RetryPolicy};
    use crate::template::Bindings;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    struct MockLlmProvider {
        response: String,
        delay: Duration,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLlmProvider {
        fn new(response: &str) -> Self {
            Self {
                response: response.to_string(),
                delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn slow(response: &str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(response)
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            if let Some(prompt) = request.last_user_content() {
                self.prompts.lock().unwrap().push(prompt.to_string());
            }
            tokio::time::sleep(self.delay).await;
            Ok(GenerationResponse::from_text("mock", self.response.clone()))
        }
    }

    fn optimizer(provider: Arc<MockLlmProvider>, config: OptimizerConfig) -> Optimizer {
        let policy = RetryPolicy::new(1, Duration::ZERO, Duration::from_secs(5));
        Optimizer::new(Completer::new(provider, policy), config)
    }

    fn version(template: &str) -> PromptVersion {
        PromptVersion {
            project_slug: "news".into(),
            ordinal: 0,
            template: template.into(),
            rationale: None,
            parent_ordinal: None,
            created_at: Utc::now(),
        }
    }

    fn result(article: &str, output: &str, score: f64) -> EvaluationResult {
        EvaluationResult {
            run_id: Uuid::nil(),
            version_ordinal: 0,
            case_id: Uuid::new_v4(),
            bindings: Bindings::new().with("article", article),
            expected_output: Some("A crisp summary.".into()),
            rendered_prompt: format!("Summarize: {article}"),
            output: output.into(),
            score,
            passed: score >= 0.85,
            notes: "Too verbose (90 vs 3)".into(),
            failure: None,
        }
    }

    const GOOD_PROPOSAL: &str = r#"{"improved_prompt": "Summarize in one sentence: {{article}}", "rationale": "Outputs were too verbose"}"#;

    #[tokio::test]
    async fn test_insufficient_data() {
        let opt = optimizer(Arc::new(MockLlmProvider::new(GOOD_PROPOSAL)), OptimizerConfig::default());
        let err = opt
            .propose(&version("Summarize: {{article}}"), &VariableSet::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::InsufficientData));
    }

    #[tokio::test]
    async fn test_proposal_preserves_variables_and_rationale() {
        let provider = Arc::new(MockLlmProvider::new(GOOD_PROPOSAL));
        let opt = optimizer(provider.clone(), OptimizerConfig::default());
        let results = vec![result("long story", "way too long output", 0.2)];

        let proposal = opt
            .propose(&version("Summarize: {{article}}"), &VariableSet::new(), &results)
            .await
            .unwrap();
        assert!(proposal.template.contains("{{article}}"));
        assert_eq!(proposal.rationale, "Outputs were too verbose");

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("Required variables: {{article}}"));
        assert!(prompts[0].contains("Too verbose (90 vs 3)"));
    }

    #[tokio::test]
    async fn test_variable_loss_is_fatal() {
        let response = r#"{"improved_prompt": "Write a summary.", "rationale": "simpler"}"#;
        let opt = optimizer(Arc::new(MockLlmProvider::new(response)), OptimizerConfig::default());
        let err = opt
            .propose(
                &version("Summarize: {{article}}"),
                &VariableSet::new(),
                &[result("a", "b", 0.1)],
            )
            .await
            .unwrap_err();
        match err {
            OptimizerError::VariableLoss { missing } => assert_eq!(missing, vec!["article"]),
            other => panic!("expected VariableLoss, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_rationale_is_rejected() {
        let response = r#"{"improved_prompt": "Summarize: {{article}}", "rationale": "  "}"#;
        let opt = optimizer(Arc::new(MockLlmProvider::new(response)), OptimizerConfig::default());
        let err = opt
            .propose(&version("Summarize: {{article}}"), &VariableSet::new(), &[result("a", "b", 0.1)])
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::ProposalRejected(_)));
    }

    #[tokio::test]
    async fn test_timeout_fails_the_call() {
        let provider = Arc::new(MockLlmProvider::slow(GOOD_PROPOSAL, Duration::from_secs(5)));
        let config = OptimizerConfig::default().with_timeout(Duration::from_millis(50));
        let err = optimizer(provider, config)
            .propose(&version("Summarize: {{article}}"), &VariableSet::new(), &[result("a", "b", 0.1)])
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::OptimizationTimeout { .. }));
    }

    #[test]
    fn test_critique_prefers_worst_failures() {
        let opt = optimizer(Arc::new(MockLlmProvider::new("")), OptimizerConfig::default());
        let long_article = "x".repeat(400);
        let results = vec![
            result("ok", "fine", 0.95),
            result("bad", "meh", 0.5),
            result(&long_article, "worse", 0.1),
            result("c", "c", 0.3),
            result("d", "d", 0.4),
        ];

        let critique = opt.build_critique(&results);
        assert_eq!(critique.len(), 3);
        let scores: Vec<f64> = critique.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.1, 0.3, 0.4]);
        assert!(critique[0].input_snippet.chars().count() <= 153);
    }

    #[test]
    fn test_critique_falls_back_to_lowest_passing() {
        let opt = optimizer(Arc::new(MockLlmProvider::new("")), OptimizerConfig::default());
        let results = vec![result("a", "a", 0.99), result("b", "b", 0.9)];
        let critique = opt.build_critique(&results);
        assert_eq!(critique.len(), 2);
        assert_eq!(critique[0].score, 0.9);
    }

    #[tokio::test]
    async fn test_batch_variables_must_be_preserved() {
        let provider = Arc::new(MockLlmProvider::new(GOOD_PROPOSAL));
        let opt = optimizer(provider.clone(), OptimizerConfig::default());
        let batch_variables: VariableSet =
            ["article".to_string(), "audience".to_string()].into_iter().collect();

        let err = opt
            .propose(
                &version("Summarize: {{article}}"),
                &batch_variables,
                &[result("a", "b", 0.1)],
            )
            .await
            .unwrap_err();
        match err {
            OptimizerError::VariableLoss { missing } => assert_eq!(missing, vec!["audience"]),
            other => panic!("expected VariableLoss, got {other:?}"),
        }

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("Required variables: {{article}}, {{audience}}"));
    }

    #[tokio::test]
    async fn test_critique_text_is_not_substituted() {
        let provider = Arc::new(MockLlmProvider::new(GOOD_PROPOSAL));
        let opt = optimizer(provider.clone(), OptimizerConfig::default());
        let results = vec![result("a", "literal {template} and {required}", 0.1)];

        opt.propose(&version("Summarize: {{article}}"), &VariableSet::new(), &results)
            .await
            .unwrap();

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("literal {template} and {required}"));
        assert_eq!(prompts[0].matches("Summarize: {{article}}").count(), 1);
    }

    #[tokio::test]
    async fn test_optimize_appends_with_parent() {
        let db = Database::in_memory().await.unwrap();
        let (_, v0) = db
            .create_project("news", "News", "Summarize: {{article}}")
            .await
            .unwrap();
        let opt = optimizer(Arc::new(MockLlmProvider::new(GOOD_PROPOSAL)), OptimizerConfig::default());

        let v1 = opt
            .optimize(&db, &v0, &v0.variables(), &[result("a", "b", 0.1)])
            .await
            .unwrap();
        assert_eq!(v1.ordinal, 1);
        assert_eq!(v1.parent_ordinal, Some(0));
        let latest = db.latest_version("news").await.unwrap();
        assert_eq!(latest.ordinal, 1);
        assert_eq!(latest.template, "Summarize in one sentence: {{article}}");
        assert_eq!(latest.rationale.as_deref(), Some("Outputs were too verbose"));
    }
}
