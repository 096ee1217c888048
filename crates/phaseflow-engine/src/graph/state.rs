use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-run variable store.
///
/// Created fresh for each run and owned by it. Nodes read their inputs from
/// and write their outputs to this map; it is folded into the phase report
/// when the run finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    data: HashMap<String, serde_json::Value>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore state from a checkpoint's variables.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Get any value as display text (strings unquoted, others as JSON).
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.data.get(key).map(display_value)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Collect the values of `keys` in the requested order, skipping absent keys.
    pub fn collect(&self, keys: &[String]) -> Vec<serde_json::Value> {
        keys.iter()
            .filter_map(|key| {
                let value = self.data.get(key);
                if value.is_none() {
                    debug!(key = %key, "Aggregation skipped absent key");
                }
                value.cloned()
            })
            .collect()
    }

    /// Resolve `{{name}}` placeholders against the variables first, then
    /// `fixed`. Unknown placeholders are left untouched.
    pub fn render(&self, template: &str, fixed: &HashMap<&str, String>) -> String {
        placeholder_regex()
            .replace_all(template, |caps: &Captures| {
                let name = &caps[1];
                if let Some(value) = self.data.get(name) {
                    display_value(value)
                } else if let Some(value) = fixed.get(name) {
                    value.clone()
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn into_map(self) -> HashMap<String, serde_json::Value> {
        self.data
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut state = ExecutionState::new();
        state.set_str("name", "Alice");
        state.set("count", serde_json::json!(42));

        assert_eq!(state.get_str("name"), Some("Alice"));
        assert_eq!(state.get("count"), Some(&serde_json::json!(42)));
        assert_eq!(state.get_text("count").as_deref(), Some("42"));
        assert_eq!(state.get("missing"), None);
    }

    #[test]
    fn test_collect_preserves_order_and_skips_absent() {
        let mut state = ExecutionState::new();
        state.set_str("b", "second");
        state.set_str("a", "first");

        let values = state.collect(&["a".into(), "missing".into(), "b".into()]);
        assert_eq!(
            values,
            vec![serde_json::json!("first"), serde_json::json!("second")]
        );
    }

    #[test]
    fn test_render_prefers_variables_over_fixed_fields() {
        let mut state = ExecutionState::new();
        state.set_str("feature", "dark mode");
        state.set_str("branch", "override");

        let mut fixed = HashMap::new();
        fixed.insert("branch", "main".to_string());
        fixed.insert("project_path", "/repo".to_string());

        let rendered = state.render(
            "Plan {{feature}} in {{ project_path }} on {{branch}} ({{unknown}})",
            &fixed,
        );
        assert_eq!(rendered, "Plan dark mode in /repo on override ({{unknown}})");
    }

    #[test]
    fn test_render_non_string_values() {
        let mut state = ExecutionState::new();
        state.set("items", serde_json::json!(["a", "b"]));
        let rendered = state.render("Items: {{items}}", &HashMap::new());
        assert_eq!(rendered, r#"Items: ["a","b"]"#);
    }

    #[test]
    fn test_from_map() {
        let mut map = HashMap::new();
        map.insert("topic".into(), serde_json::json!("AI"));
        let state = ExecutionState::from_map(map);
        assert_eq!(state.get_str("topic"), Some("AI"));
        assert_eq!(state.into_map().len(), 1);
    }
}
