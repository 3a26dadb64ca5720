//! JSON extraction utilities for parsing LLM responses.
//!
//! Models wrap structured answers in markdown fences, prepend explanations or
//! get cut off mid-array. The functions here locate the JSON payload of a
//! given [`JsonShape`] inside such a response.
//!
//! # Extraction Strategies
//!
//! Tried in order, each candidate validated with `serde_json`:
//! 1. JSON in a ```` ```json ```` or generic code fence
//! 2. Direct JSON (content starts with `{` or `[`)
//! 3. First object/array anywhere in the content, by bracket matching
//!
//! # Example
//!
//! ```
//! use prompt_forge::utils::json_extraction::{extract_json, JsonShape};
//!
//! let response = "Here you go:\n```json\n[{\"a\": 1}]\n```";
//! assert_eq!(extract_json(response, JsonShape::Array).unwrap(), "[{\"a\": 1}]");
//! ```

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Error type for JSON extraction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed} unclosed delimiters. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed: usize,
    },
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Top-level shape of the expected payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    Object,
    Array,
}

impl JsonShape {
    fn delimiters(self) -> (char, char) {
        match self {
            JsonShape::Object => ('{', '}'),
            JsonShape::Array => ('[', ']'),
        }
    }
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"```(?:[A-Za-z]+)?\s*\n?([\s\S]*?)\n?```").expect("fence regex is valid")
    })
}

/// Extracts the first valid JSON value of `shape` from `content`.
pub fn extract_json(content: &str, shape: JsonShape) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();
    let (open, close) = shape.delimiters();

    // Strategy 1: fenced code blocks
    for caps in fence_regex().captures_iter(trimmed) {
        if let Some(block) = caps.get(1) {
            if let Some(json) = first_valid(block.as_str().trim(), open, close) {
                return Ok(json);
            }
        }
    }

    // Strategy 2 and 3: direct or embedded
    if let Some(json) = first_valid(trimmed, open, close) {
        return Ok(json);
    }

    if let Some(start) = trimmed.find(open) {
        let unclosed = count_unclosed(&trimmed[start..]);
        if unclosed > 0 {
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(&trimmed[start..], 100),
                unclosed,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed, 50),
    })
}

/// Tries every `open` position in order and returns the first candidate that parses.
fn first_valid(s: &str, open: char, close: char) -> Option<String> {
    s.char_indices()
        .filter(|&(_, c)| c == open)
        .find_map(|(start, _)| {
            let end = find_matching(&s[start..], open, close)?;
            let candidate = &s[start..=start + end];
            serde_json::from_str::<serde_json::Value>(candidate)
                .is_ok()
                .then(|| candidate.to_string())
        })
}

/// Finds the index of the delimiter closing the one `s` starts with.
///
/// Handles nesting, string literals and escape sequences within strings.
pub fn find_matching(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Counts `{`/`[` left open at the end of `s`, ignoring string contents.
fn count_unclosed(s: &str) -> usize {
    let mut stack = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => stack += 1,
            '}' | ']' if !in_string => stack = stack.saturating_sub(1),
            _ => {}
        }
    }
    stack
}

fn preview(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
