//! Scoring of model outputs against expected references.
//!
//! A score is a weighted blend of three components:
//!
//! | Component | Weight | Measures |
//! |-----------|--------|----------|
//! | correctness | 0.70 | agreement with the reference (token F1, or an LLM judge) |
//! | format | 0.15 | JSON-shaped or bullet-list references demand the same shape |
//! | length | 0.15 | word count close to the reference |
//!
//! Every scorer is deterministic for a given (output, reference) pair, so
//! re-scoring a stored output yields the same value.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LlmError;
use crate::llm::Completer;
use crate::utils::{extract_json, truncate_chars, JsonShape};

pub const CORRECTNESS_WEIGHT: f64 = 0.70;
pub const FORMAT_WEIGHT: f64 = 0.15;
pub const LENGTH_WEIGHT: f64 = 0.15;

/// Below this a component is called out in the notes.
const COMPONENT_NOTE_THRESHOLD: f64 = 0.8;

/// Component scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub correctness: f64,
    pub format: f64,
    pub length: f64,
}

impl ScoreBreakdown {
    /// Weighted total in [0, 1].
    pub fn weighted(&self) -> f64 {
        let total = self.correctness * CORRECTNESS_WEIGHT
            + self.format * FORMAT_WEIGHT
            + self.length * LENGTH_WEIGHT;
        total.clamp(0.0, 1.0)
    }
}

/// Score of one output plus a short explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: f64,
    pub breakdown: ScoreBreakdown,
    pub notes: String,
}

/// Scores a model output against an optional reference.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    async fn score(&self, output: &str, reference: Option<&str>) -> Result<Score, LlmError>;
}

// =============================================================================
// Heuristic components
// =============================================================================

fn bullet_regex() -> &'static Regex {
    static BULLET: OnceLock<Regex> = OnceLock::new();
    BULLET.get_or_init(|| Regex::new(r"(?m)^\s*[-*•]\s").expect("bullet regex is valid"))
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Token-level F1 between output and reference, case-insensitive.
pub fn token_f1(output: &str, reference: &str) -> f64 {
    let out_tokens = tokenize(output);
    let ref_tokens = tokenize(reference);

    if out_tokens.is_empty() && ref_tokens.is_empty() {
        return 1.0;
    }
    if out_tokens.is_empty() || ref_tokens.is_empty() {
        return 0.0;
    }

    let mut ref_counts: HashMap<&str, usize> = HashMap::new();
    for token in &ref_tokens {
        *ref_counts.entry(token.as_str()).or_insert(0) += 1;
    }

    let mut overlap = 0usize;
    for token in &out_tokens {
        if let Some(count) = ref_counts.get_mut(token.as_str()) {
            if *count > 0 {
                *count -= 1;
                overlap += 1;
            }
        }
    }

    if overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f64 / out_tokens.len() as f64;
    let recall = overlap as f64 / ref_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// 1.0 when the output has the shape the reference demands.
pub fn format_adherence(output: &str, reference: &str) -> f64 {
    let output = output.trim();
    let reference = reference.trim();

    let json_shape = if reference.starts_with('{') && reference.ends_with('}') {
        Some(JsonShape::Object)
    } else if reference.starts_with('[') && reference.ends_with(']') {
        Some(JsonShape::Array)
    } else {
        None
    };

    if let Some(shape) = json_shape {
        return if extract_json(output, shape).is_ok() {
            1.0
        } else {
            0.0
        };
    }

    if bullet_regex().is_match(reference) {
        return if bullet_regex().is_match(output) {
            1.0
        } else {
            0.0
        };
    }

    1.0
}

/// Word-count consistency between output and reference.
///
/// Short references (< 50 words) tolerate an absolute difference of 20 words;
/// longer ones accept any ratio between 0.5 and 2.
pub fn length_consistency(output: &str, reference: &str) -> f64 {
    let actual = output.split_whitespace().count() as f64;
    let expected = reference.split_whitespace().count() as f64;

    if expected < 50.0 {
        let diff = (actual - expected).abs();
        return if diff <= 20.0 {
            1.0
        } else {
            (1.0 - diff / 40.0).max(0.0)
        };
    }

    let ratio = actual / expected;
    if (0.5..=2.0).contains(&ratio) {
        return 1.0;
    }
    let distance = (ratio - 0.5).abs().min((ratio - 2.0).abs());
    (1.0 - distance / 2.0).max(0.0)
}

/// Builds the failure notes for a breakdown; "Good match" when nothing is weak.
fn describe(
    breakdown: &ScoreBreakdown,
    output: &str,
    reference: Option<&str>,
    judge_reason: Option<&str>,
) -> String {
    let mut notes = Vec::new();

    if breakdown.correctness < COMPONENT_NOTE_THRESHOLD {
        match judge_reason {
            Some(reason) if !reason.is_empty() => notes.push(format!("Logic weak ({})", reason)),
            _ => notes.push("Logic weak".to_string()),
        }
    }
    if breakdown.format < 1.0 {
        notes.push("Wrong format".to_string());
    }
    if breakdown.length < COMPONENT_NOTE_THRESHOLD {
        if let Some(reference) = reference {
            let actual = output.split_whitespace().count();
            let expected = reference.split_whitespace().count();
            if actual > expected {
                notes.push(format!("Too verbose ({} vs {})", actual, expected));
            } else {
                notes.push(format!("Too brief ({} vs {})", actual, expected));
            }
        }
    }

    if notes.is_empty() {
        judge_reason
            .filter(|r| !r.is_empty())
            .unwrap_or("Good match")
            .to_string()
    } else {
        notes.join("; ")
    }
}

/// Format and length components; both are neutral without a reference.
fn shape_components(output: &str, reference: Option<&str>) -> (f64, f64) {
    match reference {
        Some(reference) => (
            format_adherence(output, reference),
            length_consistency(output, reference),
        ),
        None => (1.0, 1.0),
    }
}

/// Correctness without a reference: any non-empty output counts.
fn presence(output: &str) -> f64 {
    if output.trim().is_empty() {
        0.0
    } else {
        1.0
    }
}

// =============================================================================
// HeuristicScorer
// =============================================================================

/// Offline scorer: token F1 for correctness.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous scoring, also used by the judge for its shape components.
    pub fn score_sync(&self, output: &str, reference: Option<&str>) -> Score {
        let correctness = match reference {
            Some(reference) => token_f1(output, reference),
            None => presence(output),
        };
        let (format, length) = shape_components(output, reference);
        let breakdown = ScoreBreakdown {
            correctness,
            format,
            length,
        };
        Score {
            value: breakdown.weighted(),
            notes: describe(&breakdown, output, reference, None),
            breakdown,
        }
    }
}

#[async_trait]
impl Scorer for HeuristicScorer {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn score(&self, output: &str, reference: Option<&str>) -> Result<Score, LlmError> {
        Ok(self.score_sync(output, reference))
    }
}

// =============================================================================
// JudgeScorer
// =============================================================================

/// System prompt for the correctness judge.
const JUDGE_SYSTEM_PROMPT: &str = r#"Act as an impartial judge. Compare the Actual Response to the Expected Answer.

EVALUATION CRITERIA:
1. Accuracy: does the actual response convey the same key facts and intent as the expected answer?
2. Tone: is the tone similar?

OUTPUT JSON ONLY:
{"score": <0.0 to 1.0>, "reason": "<concise explanation of the score>"}"#;

#[derive(Debug, Clone, Deserialize)]
struct Judgement {
    score: f64,
    #[serde(default)]
    reason: String,
}

/// Scorer whose correctness component is an LLM rubric judgement.
///
/// Judgements are memoised by SHA-256 of (output, reference), so the same
/// stored output always receives the same score within a process.
pub struct JudgeScorer {
    completer: Completer,
    memo: Mutex<HashMap<String, Judgement>>,
}

impl std::fmt::Debug for JudgeScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeScorer")
            .field("completer", &self.completer)
            .finish_non_exhaustive()
    }
}

impl JudgeScorer {
    /// Creates a judge; the completer is pinned to temperature 0.
    pub fn new(completer: Completer) -> Self {
        Self {
            completer: completer.with_temperature(0.0),
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn memo_key(output: &str, reference: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(output.as_bytes());
        hasher.update([0u8]);
        hasher.update(reference.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn cached(&self, key: &str) -> Option<Judgement> {
        self.memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    async fn judge(&self, output: &str, reference: &str) -> Result<Judgement, LlmError> {
        let key = Self::memo_key(output, reference);
        if let Some(judgement) = self.cached(&key) {
            tracing::trace!(key = %&key[..12], "Judge memo hit");
            return Ok(judgement);
        }

        let prompt = format!(
            "EXPECTED ANSWER (Ground Truth):\n{}\n\nACTUAL RESPONSE:\n{}",
            reference, output
        );
        let response = self
            .completer
            .complete_with_system(Some(JUDGE_SYSTEM_PROMPT), &prompt)
            .await?;

        let json = extract_json(&response, JsonShape::Object)
            .map_err(|e| LlmError::ParseError(format!("judge response: {}", e)))?;
        let mut judgement: Judgement = serde_json::from_str(&json)
            .map_err(|e| LlmError::ParseError(format!("judge response: {}", e)))?;
        judgement.score = judgement.score.clamp(0.0, 1.0);
        judgement.reason = truncate_chars(&judgement.reason, 200);

        self.memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key)
            .or_insert_with(|| judgement.clone());

        Ok(judgement)
    }
}

#[async_trait]
impl Scorer for JudgeScorer {
    fn name(&self) -> &'static str {
        "judge"
    }

    async fn score(&self, output: &str, reference: Option<&str>) -> Result<Score, LlmError> {
        let Some(reference) = reference else {
            return Ok(HeuristicScorer.score_sync(output, None));
        };
        if output.trim().is_empty() {
            return Ok(HeuristicScorer.score_sync(output, Some(reference)));
        }

        let judgement = self.judge(output, reference).await?;
        let (format, length) = shape_components(output, Some(reference));
        let breakdown = ScoreBreakdown {
            correctness: judgement.score,
            format,
            length,
        };
        Ok(Score {
            value: breakdown.weighted(),
            notes: describe(&breakdown, output, Some(reference), Some(&judgement.reason)),
            breakdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_token_f1() {
        assert!((token_f1("The cat sat", "the cat sat") - 1.0).abs() < 1e-9);
        assert_eq!(token_f1("dog", "cat"), 0.0);
        let partial = token_f1("the cat", "the cat sat down");
        assert!(partial > 0.5 && partial < 1.0);
        assert_eq!(token_f1("", "x"), 0.0);
    }

    #[test]
    fn test_format_adherence_json() {
        assert_eq!(format_adherence(r#"{"status": "error"}"#, r#"{"status": "error"}"#), 1.0);
        assert_eq!(
            format_adherence("```json\n{\"a\": 1}\n```", r#"{"a": 2}"#),
            1.0
        );
        assert_eq!(format_adherence("Sure, here it is", r#"{"a": 2}"#), 0.0);
    }

    #[test]
    fn test_format_adherence_bullets() {
        assert_eq!(format_adherence("- one\n- two", "- a\n- b"), 1.0);
        assert_eq!(format_adherence("one and two", "- a\n- b"), 0.0);
        assert_eq!(format_adherence("anything", "plain reference"), 1.0);
    }

    #[test]
    fn test_length_consistency() {
        assert_eq!(length_consistency("a b c", "a b c d"), 1.0);
        let long_output = vec!["w"; 60].join(" ");
        assert_eq!(length_consistency(&long_output, "short"), 0.0);
        let ref_100 = vec!["w"; 100].join(" ");
        let out_150 = vec!["w"; 150].join(" ");
        assert_eq!(length_consistency(&out_150, &ref_100), 1.0);
    }

    #[test]
    fn test_heuristic_perfect_match() {
        let score = HeuristicScorer.score_sync("Rust 1.80 is out.", Some("Rust 1.80 is out."));
        assert!((score.value - 1.0).abs() < 1e-9);
        assert_eq!(score.notes, "Good match");
    }

    #[test]
    fn test_heuristic_notes_name_weak_components() {
        let verbose = vec!["filler"; 80].join(" ");
        let score = HeuristicScorer.score_sync(&verbose, Some(r#"{"status": "error"}"#));
        assert!(score.value < 0.2);
        assert!(score.notes.contains("Logic weak"));
        assert!(score.notes.contains("Wrong format"));
        assert!(score.notes.contains("Too verbose (80 vs 2)"));
    }

    #[test]
    fn test_heuristic_without_reference() {
        let score = HeuristicScorer.score_sync("some output", None);
        assert!((score.value - 1.0).abs() < 1e-9);
        let empty = HeuristicScorer.score_sync("  ", None);
        assert!((empty.value - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_heuristic_is_deterministic() {
        let a = HeuristicScorer.score_sync("the quick fox", Some("a quick brown fox"));
        let b = HeuristicScorer.score_sync("the quick fox", Some("a quick brown fox"));
        assert_eq!(a, b);
    }

    struct CountingJudge {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for CountingJudge {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            // A different answer each call; memoisation must hide that.
            let score = if n == 0 { 0.9 } else { 0.1 };
            Ok(GenerationResponse::from_text(
                "judge",
                format!(r#"{{"score": {score}, "reason": "close enough"}}"#),
            ))
        }
    }

    #[tokio::test]
    async fn test_judge_memoises_by_output_and_reference() {
        let provider = Arc::new(CountingJudge {
            calls: AtomicU32::new(0),
        });
        let completer = Completer::new(
            provider.clone(),
            RetryPolicy::new(1, Duration::ZERO, Duration::from_secs(5)),
        );
        let judge = JudgeScorer::new(completer);

        let first = judge.score("Rust is out", Some("Rust is out")).await.unwrap();
        let second = judge.score("Rust is out", Some("Rust is out")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!((first.breakdown.correctness - 0.9).abs() < 1e-9);
        assert_eq!(first.notes, "close enough");

        judge.score("Other", Some("Rust is out")).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_judge_skips_call_without_reference() {
        let provider = Arc::new(CountingJudge {
            calls: AtomicU32::new(0),
        });
        let judge = JudgeScorer::new(Completer::new(provider.clone(), RetryPolicy::default()));
        let score = judge.score("anything", None).await.unwrap();
        assert!((score.value - 1.0).abs() < 1e-9);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
