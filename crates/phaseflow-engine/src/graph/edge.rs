use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::ConditionEvaluator;

/// An edge connecting two nodes in a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Expression that must evaluate true to traverse this edge.
    /// Absent means always.
    #[serde(default)]
    pub guard: Option<String>,
}

impl WorkflowEdge {
    /// Create an unconditional edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    /// Create a guarded edge.
    pub fn guarded(
        from: impl Into<String>,
        to: impl Into<String>,
        guard: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Some(guard.into()),
        }
    }
}

/// Default expression language for conditional nodes and edge guards.
///
/// Supported expressions:
/// - `true` / `false`
/// - `key == "value"`, `key != "value"`, `key contains "substr"`
/// - `key` (truthy) and `!key` (falsy)
///
/// Non-string values are compared by their JSON text, so `approved == "true"`
/// matches a boolean. Missing keys never match.
#[derive(Debug, Clone, Default)]
pub struct SimpleConditionEvaluator;

impl SimpleConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate synchronously.
    pub fn eval(
        &self,
        expr: &str,
        variables: &HashMap<String, serde_json::Value>,
    ) -> Result<bool> {
        evaluate_condition(expr, variables)
    }
}

impl ConditionEvaluator for SimpleConditionEvaluator {
    fn evaluate<'a>(
        &'a self,
        expr: &'a str,
        variables: &'a HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { evaluate_condition(expr, variables) })
    }
}

/// Evaluate a simple expression against the run's variables.
pub fn evaluate_condition(
    expr: &str,
    variables: &HashMap<String, serde_json::Value>,
) -> Result<bool> {
    let expr = expr.trim();

    match expr {
        "true" => return Ok(true),
        "false" => return Ok(false),
        "" => {
            return Err(PhaseflowError::Condition {
                expr: expr.to_string(),
                message: "empty expression".into(),
            })
        }
        _ => {}
    }

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return Ok(lookup(variables, key).is_some_and(|s| s.contains(substr)));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return Ok(lookup(variables, key).is_some_and(|s| s != value));
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return Ok(lookup(variables, key).is_some_and(|s| s == value));
    }

    if let Some(key) = expr.strip_prefix('!') {
        let key = key.trim();
        if is_identifier(key) {
            return Ok(!is_truthy(variables.get(key)));
        }
    }

    if is_identifier(expr) {
        return Ok(is_truthy(variables.get(expr)));
    }

    Err(PhaseflowError::Condition {
        expr: expr.to_string(),
        message: "unsupported expression".into(),
    })
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if !is_identifier(key) {
        return None;
    }
    let val = val.trim().trim_matches('"');
    Some((key, val))
}

fn lookup(variables: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    variables.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn is_truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(serde_json::Value::String(s)) => {
            let s = s.trim().to_lowercase();
            !(s.is_empty() || s == "false" || s == "no" || s == "0")
        }
        Some(serde_json::Value::Array(a)) => !a.is_empty(),
        Some(serde_json::Value::Object(o)) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_edge_builders() {
        let e = WorkflowEdge::new("a", "b");
        assert_eq!(e.from, "a");
        assert_eq!(e.to, "b");
        assert!(e.guard.is_none());

        let e = WorkflowEdge::guarded("a", "c", "ready");
        assert_eq!(e.guard.as_deref(), Some("ready"));
    }

    #[test]
    fn test_condition_equals() {
        let ctx = vars(&[("status", serde_json::json!("success"))]);

        assert!(evaluate_condition(r#"status == "success""#, &ctx).unwrap());
        assert!(!evaluate_condition(r#"status == "failure""#, &ctx).unwrap());
    }

    #[test]
    fn test_condition_not_equals() {
        let ctx = vars(&[("status", serde_json::json!("success"))]);

        assert!(evaluate_condition(r#"status != "failure""#, &ctx).unwrap());
        assert!(!evaluate_condition(r#"status != "success""#, &ctx).unwrap());
    }

    #[test]
    fn test_condition_contains() {
        let ctx = vars(&[(
            "output",
            serde_json::json!("The file was created successfully."),
        )]);

        assert!(evaluate_condition(r#"output contains "created""#, &ctx).unwrap());
        assert!(!evaluate_condition(r#"output contains "deleted""#, &ctx).unwrap());
    }

    #[test]
    fn test_condition_non_string_values() {
        let ctx = vars(&[
            ("approved", serde_json::json!(true)),
            ("count", serde_json::json!(3)),
        ]);

        assert!(evaluate_condition(r#"approved == "true""#, &ctx).unwrap());
        assert!(evaluate_condition("count == 3", &ctx).unwrap());
    }

    #[test]
    fn test_condition_missing_key() {
        let ctx = HashMap::new();
        assert!(!evaluate_condition(r#"missing == "value""#, &ctx).unwrap());
        assert!(!evaluate_condition(r#"missing != "value""#, &ctx).unwrap());
        assert!(!evaluate_condition("missing", &ctx).unwrap());
        assert!(evaluate_condition("!missing", &ctx).unwrap());
    }

    #[test]
    fn test_condition_truthy() {
        let ctx = vars(&[
            ("yes", serde_json::json!("ok")),
            ("no", serde_json::json!("false")),
            ("empty", serde_json::json!([])),
            ("zero", serde_json::json!(0)),
        ]);

        assert!(evaluate_condition("yes", &ctx).unwrap());
        assert!(!evaluate_condition("no", &ctx).unwrap());
        assert!(!evaluate_condition("empty", &ctx).unwrap());
        assert!(!evaluate_condition("zero", &ctx).unwrap());
        assert!(evaluate_condition("!no", &ctx).unwrap());
    }

    #[test]
    fn test_condition_literals() {
        let ctx = HashMap::new();
        assert!(evaluate_condition("true", &ctx).unwrap());
        assert!(!evaluate_condition(" false ", &ctx).unwrap());
    }

    #[test]
    fn test_condition_invalid_expr() {
        let ctx = HashMap::new();
        assert!(matches!(
            evaluate_condition("this is not valid", &ctx),
            Err(PhaseflowError::Condition { .. })
        ));
        assert!(evaluate_condition("   ", &ctx).is_err());
    }

    #[tokio::test]
    async fn test_evaluator_trait() {
        let evaluator = SimpleConditionEvaluator::new();
        let ctx = vars(&[("tests_status", serde_json::json!("success"))]);
        assert!(evaluator
            .evaluate(r#"tests_status == "success""#, &ctx)
            .await
            .unwrap());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let edge = WorkflowEdge::guarded("a", "b", r#"status == "ok""#);
        let json = serde_json::to_string(&edge).unwrap();
        let parsed: WorkflowEdge = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.from, "a");
        assert_eq!(parsed.to, "b");
        assert_eq!(parsed.guard.as_deref(), Some(r#"status == "ok""#));

        let parsed: WorkflowEdge = serde_json::from_str(r#"{"from":"x","to":"y"}"#).unwrap();
        assert!(parsed.guard.is_none());
    }
}
