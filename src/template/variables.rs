//! Variable bindings for prompt templates.
//!
//! [`Bindings`] is the explicit name → value mapping a test case supplies to a
//! template. [`Bindings::check`] is the single checkpoint where a binding set
//! is validated against a template's variables before rendering.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Sorted set of variable names referenced by a template.
pub type VariableSet = BTreeSet<String>;

/// Mapping from variable name to substitution value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bindings(BTreeMap<String, String>);

impl Bindings {
    /// Creates an empty binding set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a binding, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Inserts or replaces a binding.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns the value bound to `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the bound variable names.
    pub fn names(&self) -> VariableSet {
        self.0.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Compares these bindings against the variables a template references.
    pub fn check(&self, variables: &VariableSet) -> BindingReport {
        let names = self.names();
        BindingReport {
            missing: variables.difference(&names).cloned().collect(),
            unknown: names.difference(variables).cloned().collect(),
        }
    }
}

impl FromIterator<(String, String)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for Bindings {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Outcome of checking a binding set against a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingReport {
    /// Variables the template references that have no binding.
    pub missing: Vec<String>,
    /// Bindings the template does not reference.
    pub unknown: Vec<String>,
}

impl BindingReport {
    /// True if every referenced variable is bound.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(names: &[&str]) -> VariableSet {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bindings_builder_and_lookup() {
        let bindings = Bindings::new().with("a", "1").with("b", "2");
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings.get("a"), Some("1"));
        assert_eq!(bindings.get("z"), None);
        assert_eq!(bindings.names(), vars(&["a", "b"]));
    }

    #[test]
    fn test_check_reports_missing_and_unknown() {
        let bindings = Bindings::new().with("article", "x").with("lang", "fr");
        let report = bindings.check(&vars(&["article", "audience"]));
        assert_eq!(report.missing, vec!["audience".to_string()]);
        assert_eq!(report.unknown, vec!["lang".to_string()]);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_check_exact_match_is_complete() {
        let bindings = Bindings::new().with("article", "x");
        let report = bindings.check(&vars(&["article"]));
        assert!(report.is_complete());
        assert!(report.unknown.is_empty());
    }

    #[test]
    fn test_bindings_serialize_as_plain_map() {
        let bindings = Bindings::new().with("article", "hello");
        let json = serde_json::to_string(&bindings).unwrap();
        assert_eq!(json, r#"{"article":"hello"}"#);
        let back: Bindings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bindings);
    }
}
