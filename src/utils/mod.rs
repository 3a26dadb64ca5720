//! Shared utility functions for prompt-forge.
//!
//! This module provides common utilities used across multiple modules,
//! including JSON extraction from LLM responses and text truncation.

pub mod json_extraction;

pub use json_extraction::{extract_json, find_matching, JsonExtractionError, JsonShape};

/// Truncates `text` to at most `max_chars` characters, appending "..." when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("ééééé", 2), "éé...");
    }
}
