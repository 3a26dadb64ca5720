//! Template engine for prompt templates.
//!
//! Prompt templates reference named variables with double-brace placeholders,
//! e.g. `"Summarize: {{article}}"`. Whitespace inside the braces is allowed
//! (`{{ article }}`). Variable names start with a letter or underscore and
//! continue with letters, digits or underscores.
//!
//! # Example
//!
//! ```
//! use prompt_forge::template::{extract_variables, render, Bindings};
//!
//! let template = "Summarize for {{audience}}: {{article}}";
//! let vars = extract_variables(template);
//! assert!(vars.contains("article"));
//!
//! let bindings = Bindings::new()
//!     .with("article", "Rust 2024 ships.")
//!     .with("audience", "kids");
//! let rendered = render(template, &bindings).unwrap();
//! assert_eq!(rendered, "Summarize for kids: Rust 2024 ships.");
//! ```

pub mod variables;

pub use variables::{BindingReport, Bindings, VariableSet};

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::TemplateError;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Returns the unique variable names referenced by `template`.
///
/// The result is a sorted set, so it is independent of the order and number
/// of occurrences in the template.
pub fn extract_variables(template: &str) -> VariableSet {
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Substitutes every placeholder in `template` with its bound value.
///
/// Fails with [`TemplateError::MissingVariable`] if any placeholder has no
/// binding; nothing is rendered in that case. Bindings the template does not
/// reference are ignored. Substituted values are not re-scanned, so a value
/// containing `{{...}}` is inserted literally.
pub fn render(template: &str, bindings: &Bindings) -> Result<String, TemplateError> {
    if let Some(name) = extract_variables(template)
        .into_iter()
        .find(|name| bindings.get(name).is_none())
    {
        return Err(TemplateError::MissingVariable { name });
    }

    let rendered = placeholder_regex().replace_all(template, |caps: &Captures<'_>| {
        // Presence was checked above.
        bindings.get(&caps[1]).unwrap_or_default().to_string()
    });

    Ok(rendered.into_owned())
}

/// Validates that `template` is usable as a prompt version.
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::EmptyTemplate);
    }
    Ok(())
}

/// Returns the variables of `required` that `template` no longer references.
pub fn missing_variables(required: &VariableSet, template: &str) -> Vec<String> {
    let present = extract_variables(template);
    required.difference(&present).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_variables_unique_and_sorted() {
        let vars = extract_variables("{{b}} and {{a}} then {{ b }} again");
        let names: Vec<&str> = vars.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_extract_variables_is_idempotent_and_order_independent() {
        let t1 = "Translate {{text}} into {{language}}";
        let t2 = "Into {{language}}, translate {{text}}";
        assert_eq!(extract_variables(t1), extract_variables(t1));
        assert_eq!(extract_variables(t1), extract_variables(t2));
    }

    #[test]
    fn test_extract_ignores_single_braces_and_invalid_names() {
        let vars = extract_variables("json: {\"a\": 1} {{1abc}} {{ok_name}} {single}");
        assert_eq!(vars.len(), 1);
        assert!(vars.contains("ok_name"));
    }

    #[test]
    fn test_extract_from_template_without_variables() {
        assert!(extract_variables("Just answer politely.").is_empty());
    }

    #[test]
    fn test_render_substitutes_every_occurrence() {
        let bindings = Bindings::new().with("name", "Ada");
        let out = render("Hi {{name}}! Bye {{ name }}.", &bindings).unwrap();
        assert_eq!(out, "Hi Ada! Bye Ada.");
    }

    #[test]
    fn test_render_ignores_unreferenced_bindings() {
        let bindings = Bindings::new().with("article", "text").with("extra", "x");
        assert_eq!(
            render("Summarize: {{article}}", &bindings).unwrap(),
            "Summarize: text"
        );
    }

    #[test]
    fn test_render_missing_variable_fails() {
        let bindings = Bindings::new().with("article", "text");
        let err = render("{{article}} for {{audience}}", &bindings).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingVariable {
                name: "audience".to_string()
            }
        );
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let bindings = Bindings::new()
            .with("a", "{{b}}")
            .with("b", "should not appear");
        assert_eq!(render("x {{a}}", &bindings).unwrap(), "x {{b}}");
    }

    #[test]
    fn test_render_with_exact_bindings_never_fails() {
        let templates = [
            "{{a}}",
            "prefix {{a}} {{b}} suffix",
            "{{ a }}{{b}}{{c}}{{a}}",
            "no variables at all",
        ];
        for template in templates {
            let bindings: Bindings = extract_variables(template)
                .into_iter()
                .map(|name| (name.clone(), format!("value-of-{name}")))
                .collect();
            let rendered = render(template, &bindings).expect("exact bindings render");
            assert!(!rendered.contains("{{"));
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let bindings = Bindings::new().with("x", "1").with("y", "2");
        let template = "{{y}}-{{x}}-{{y}}";
        assert_eq!(
            render(template, &bindings).unwrap(),
            render(template, &bindings).unwrap()
        );
    }

    #[test]
    fn test_validate_template() {
        assert_eq!(validate_template("   \n"), Err(TemplateError::EmptyTemplate));
        assert!(validate_template("Summarize: {{article}}").is_ok());
    }

    #[test]
    fn test_missing_variables() {
        let required = extract_variables("{{article}} {{tone}}");
        assert_eq!(
            missing_variables(&required, "Write in {{tone}}"),
            vec!["article".to_string()]
        );
        assert!(missing_variables(&required, "{{tone}} {{article}} {{extra}}").is_empty());
    }
}
