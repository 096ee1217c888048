use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use phaseflow_core::catalog::ValidationRule;
use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::vibe::VibeCheck;

use super::edge::WorkflowEdge;
use super::node::{NodeKind, WorkflowNode};

/// Entry, exit and edges of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

/// One parsed workflow definition. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<WorkflowNode>,
    pub graph: WorkflowGraph,
    /// Checks evaluated after every phase bound to this template, in
    /// addition to the phase's own.
    #[serde(default)]
    pub vibe_checks: Vec<VibeCheck>,
}

impl WorkflowTemplate {
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<WorkflowNode>,
        start: impl Into<String>,
        end: impl Into<String>,
        edges: Vec<WorkflowEdge>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            nodes,
            graph: WorkflowGraph {
                start: start.into(),
                end: end.into(),
                edges,
            },
            vibe_checks: vec![],
        }
    }

    pub fn with_vibe_checks(mut self, checks: Vec<VibeCheck>) -> Self {
        self.vibe_checks = checks;
        self
    }

    /// Parse a template from JSON. Does not validate.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> + 'a {
        self.graph.edges.iter().filter(move |e| e.from == id)
    }

    /// Check the template before execution, reporting every issue found.
    pub fn validate(&self) -> Result<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(PhaseflowError::InvalidTemplate {
                template: self.name.clone(),
                issues,
            })
        }
    }

    /// All structural problems of this template, in a stable order.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push("template name is blank".to_string());
        }
        if self.nodes.is_empty() {
            issues.push("template has no nodes".to_string());
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                issues.push("node with blank id".to_string());
            } else if !ids.insert(node.id.as_str()) {
                issues.push(format!("duplicate node id '{}'", node.id));
            }
        }

        if !ids.contains(self.graph.start.as_str()) {
            issues.push(format!("start node '{}' does not exist", self.graph.start));
        }
        if !ids.contains(self.graph.end.as_str()) {
            issues.push(format!("end node '{}' does not exist", self.graph.end));
        }

        for edge in &self.graph.edges {
            if !ids.contains(edge.from.as_str()) {
                issues.push(format!(
                    "edge {} -> {} references missing node '{}'",
                    edge.from, edge.to, edge.from
                ));
            }
            if !ids.contains(edge.to.as_str()) {
                issues.push(format!(
                    "edge {} -> {} references missing node '{}'",
                    edge.from, edge.to, edge.to
                ));
            }
            if edge.guard.as_deref().is_some_and(|g| g.trim().is_empty()) {
                issues.push(format!("edge {} -> {} has a blank guard", edge.from, edge.to));
            }
        }

        for node in &self.nodes {
            node_issues(node, &mut issues);
            for target in node.jump_targets() {
                if !ids.contains(target) {
                    issues.push(format!(
                        "node '{}' targets missing node '{}'",
                        node.id, target
                    ));
                }
            }
        }

        issues
    }
}

fn node_issues(node: &WorkflowNode, issues: &mut Vec<String>) {
    let id = &node.id;
    let mut require = |present: bool, what: &str| {
        if !present {
            issues.push(format!("{} node '{}' {}", node.type_name(), id, what));
        }
    };

    match &node.kind {
        NodeKind::Start | NodeKind::End => {}
        NodeKind::Llm { prompt, .. } => {
            require(!prompt.trim().is_empty(), "has no prompt");
        }
        NodeKind::Conditional {
            condition,
            if_true,
            if_false,
        } => {
            require(!condition.trim().is_empty(), "has no condition");
            require(
                if_true.as_deref().is_some_and(|t| !t.trim().is_empty()),
                "has no if_true target",
            );
            require(
                if_false.as_deref().is_some_and(|t| !t.trim().is_empty()),
                "has no if_false target",
            );
        }
        NodeKind::HumanInteraction { prompt, .. } | NodeKind::Approval { prompt, .. } => {
            require(!prompt.trim().is_empty(), "has no prompt");
        }
        NodeKind::Aggregation { input_keys, .. } => {
            require(!input_keys.is_empty(), "has no input keys");
        }
        NodeKind::SystemCommand { command, .. } => {
            require(!command.trim().is_empty(), "has no command");
        }
        NodeKind::GetQuestion { question_id, .. } => {
            require(!question_id.trim().is_empty(), "has no question id");
        }
        NodeKind::AskCatalogQuestion {
            question_id,
            validation_rules,
            max_retries,
            ..
        } => {
            require(!question_id.trim().is_empty(), "has no question id");
            require(*max_retries != Some(0), "has a zero retry budget");
            rule_issues(validation_rules, &mut require);
        }
        NodeKind::ValidateAnswer {
            input_key,
            validation_rules,
            ..
        } => {
            require(!input_key.trim().is_empty(), "has no input key");
            require(!validation_rules.is_empty(), "has no validation rules");
            rule_issues(validation_rules, &mut require);
        }
    }

    if let Some(key) = node.output_key() {
        require(!key.trim().is_empty(), "has a blank output key");
    }
}

fn rule_issues(rules: &[ValidationRule], require: &mut impl FnMut(bool, &str)) {
    for rule in rules {
        if let Err(reason) = rule.check_definition() {
            require(false, &format!("has an invalid rule: {}", reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowTemplate {
        WorkflowTemplate::new(
            "linear",
            vec![
                WorkflowNode::start("start"),
                WorkflowNode::llm("llm1", "Summarize {{project_path}}", "summary"),
                WorkflowNode::end("end"),
            ],
            "start",
            "end",
            vec![
                WorkflowEdge::new("start", "llm1"),
                WorkflowEdge::new("llm1", "end"),
            ],
        )
    }

    #[test]
    fn test_valid_template() {
        let template = linear();
        assert!(template.validate().is_ok());
        assert!(template.node("llm1").is_some());
        assert_eq!(template.outgoing("start").count(), 1);
    }

    #[test]
    fn test_dangling_edge_rejected_consistently() {
        let mut template = linear();
        template.graph.edges.push(WorkflowEdge::new("llm1", "ghost"));

        let first = template.validate().unwrap_err();
        let second = template.validate().unwrap_err();
        match (&first, &second) {
            (
                PhaseflowError::InvalidTemplate { issues: a, .. },
                PhaseflowError::InvalidTemplate { issues: b, .. },
            ) => {
                assert_eq!(a, b);
                assert!(a.iter().any(|i| i.contains("'ghost'")));
            }
            other => panic!("unexpected errors: {:?}", other),
        }
    }

    #[test]
    fn test_missing_start_and_end() {
        let mut template = linear();
        template.graph.start = "nope".into();
        template.graph.end = "gone".into();
        let issues = template.issues();
        assert!(issues.iter().any(|i| i.contains("start node 'nope'")));
        assert!(issues.iter().any(|i| i.contains("end node 'gone'")));
    }

    #[test]
    fn test_all_issues_reported_together() {
        let template = WorkflowTemplate::new(
            "broken",
            vec![
                WorkflowNode::start("s"),
                WorkflowNode::llm("l", "  ", "out"),
                WorkflowNode::llm("l", "dup", "out"),
                WorkflowNode::human("h", "", "answer"),
                WorkflowNode::catalog_question("q", "", "a").with_max_retries(0),
                WorkflowNode::validate_answer(
                    "v",
                    "a",
                    vec![ValidationRule::Pattern {
                        regex: "([".into(),
                    }],
                ),
                WorkflowNode::command("c", "make").with_failure_target("missing"),
                WorkflowNode::end("e"),
            ],
            "s",
            "e",
            vec![],
        );

        let issues = template.issues();
        assert!(issues.iter().any(|i| i == "duplicate node id 'l'"));
        assert!(issues.iter().any(|i| i == "llm node 'l' has no prompt"));
        assert!(issues
            .iter()
            .any(|i| i == "human_interaction node 'h' has no prompt"));
        assert!(issues
            .iter()
            .any(|i| i == "ask_catalog_question node 'q' has no question id"));
        assert!(issues.iter().any(|i| i.contains("zero retry budget")));
        assert!(issues.iter().any(|i| i.contains("'v' has an invalid rule")));
        assert!(issues
            .iter()
            .any(|i| i == "node 'c' targets missing node 'missing'"));
    }

    #[test]
    fn test_conditional_branches_required() {
        let json = r#"{
            "name": "branchy",
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "c", "type": "conditional", "condition": "ready", "if_true": "e"},
                {"id": "e", "type": "end"}
            ],
            "graph": {"start": "s", "end": "e", "edges": [{"from": "s", "to": "c"}]}
        }"#;
        let template = WorkflowTemplate::from_json(json).unwrap();
        let issues = template.issues();
        assert_eq!(issues, vec!["conditional node 'c' has no if_false target"]);
    }

    #[test]
    fn test_blank_output_key() {
        let template = WorkflowTemplate::new(
            "t",
            vec![
                WorkflowNode::start("s"),
                WorkflowNode::aggregation("agg", vec!["a".into()], " "),
                WorkflowNode::end("e"),
            ],
            "s",
            "e",
            vec![WorkflowEdge::new("s", "agg"), WorkflowEdge::new("agg", "e")],
        );
        assert_eq!(
            template.issues(),
            vec!["aggregation node 'agg' has a blank output key"]
        );
    }
}
