use serde::{Deserialize, Serialize};

use phaseflow_core::catalog::ValidationRule;

/// A node in a workflow template.
///
/// The common fields live here; everything type-specific is carried by
/// [`NodeKind`], flattened into the same JSON object under a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier within the template.
    pub id: String,
    /// Human-readable description, used as the decision label.
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Type-specific node configuration.
///
/// Fields the validator must be able to report on (prompts, branch targets,
/// question ids) default to empty instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Llm {
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        output_key: String,
        /// Tool names offered to the model (empty = engine defaults).
        #[serde(default)]
        tools: Vec<String>,
    },
    Conditional {
        #[serde(default)]
        condition: String,
        #[serde(default)]
        if_true: Option<String>,
        #[serde(default)]
        if_false: Option<String>,
    },
    HumanInteraction {
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        output_key: String,
        /// Variables copied into the request context for the human.
        #[serde(default)]
        input_keys: Vec<String>,
    },
    Aggregation {
        #[serde(default)]
        input_keys: Vec<String>,
        #[serde(default)]
        output_key: String,
    },
    SystemCommand {
        #[serde(default)]
        command: String,
        /// Substring the output must contain for the command to count as passed.
        #[serde(default)]
        expected_output: Option<String>,
        #[serde(default)]
        output_key: Option<String>,
        #[serde(default)]
        on_failure: Option<String>,
    },
    GetQuestion {
        #[serde(default)]
        question_id: String,
        #[serde(default)]
        output_key: String,
    },
    AskCatalogQuestion {
        #[serde(default)]
        question_id: String,
        #[serde(default)]
        output_key: String,
        /// Overrides the catalog question's own rules when non-empty.
        #[serde(default)]
        validation_rules: Vec<ValidationRule>,
        /// Answers allowed before escalation (default: engine setting).
        #[serde(default)]
        max_retries: Option<u32>,
        #[serde(default)]
        on_failure: Option<String>,
    },
    ValidateAnswer {
        #[serde(default)]
        input_key: String,
        #[serde(default)]
        validation_rules: Vec<ValidationRule>,
        #[serde(default)]
        on_failure: Option<String>,
    },
    Approval {
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        output_key: String,
        #[serde(default)]
        on_reject: Option<String>,
    },
}

impl WorkflowNode {
    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            kind,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::End)
    }

    pub fn llm(
        id: impl Into<String>,
        prompt: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::Llm {
                prompt: prompt.into(),
                output_key: output_key.into(),
                tools: vec![],
            },
        )
    }

    pub fn conditional(
        id: impl Into<String>,
        condition: impl Into<String>,
        if_true: impl Into<String>,
        if_false: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::Conditional {
                condition: condition.into(),
                if_true: Some(if_true.into()),
                if_false: Some(if_false.into()),
            },
        )
    }

    pub fn human(
        id: impl Into<String>,
        prompt: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::HumanInteraction {
                prompt: prompt.into(),
                output_key: output_key.into(),
                input_keys: vec![],
            },
        )
    }

    pub fn aggregation(
        id: impl Into<String>,
        input_keys: Vec<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::Aggregation {
                input_keys,
                output_key: output_key.into(),
            },
        )
    }

    pub fn command(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::SystemCommand {
                command: command.into(),
                expected_output: None,
                output_key: None,
                on_failure: None,
            },
        )
    }

    pub fn get_question(
        id: impl Into<String>,
        question_id: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::GetQuestion {
                question_id: question_id.into(),
                output_key: output_key.into(),
            },
        )
    }

    pub fn catalog_question(
        id: impl Into<String>,
        question_id: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::AskCatalogQuestion {
                question_id: question_id.into(),
                output_key: output_key.into(),
                validation_rules: vec![],
                max_retries: None,
                on_failure: None,
            },
        )
    }

    pub fn validate_answer(
        id: impl Into<String>,
        input_key: impl Into<String>,
        validation_rules: Vec<ValidationRule>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::ValidateAnswer {
                input_key: input_key.into(),
                validation_rules,
                on_failure: None,
            },
        )
    }

    pub fn approval(
        id: impl Into<String>,
        prompt: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::Approval {
                prompt: prompt.into(),
                output_key: output_key.into(),
                on_reject: None,
            },
        )
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the failure path (`on_failure`, or `on_reject` for approvals).
    /// Ignored by node types without one.
    pub fn with_failure_target(mut self, target: impl Into<String>) -> Self {
        let target = Some(target.into());
        match &mut self.kind {
            NodeKind::SystemCommand { on_failure, .. }
            | NodeKind::AskCatalogQuestion { on_failure, .. }
            | NodeKind::ValidateAnswer { on_failure, .. } => *on_failure = target,
            NodeKind::Approval { on_reject, .. } => *on_reject = target,
            _ => {}
        }
        self
    }

    /// Set the retry budget of a catalog-question node.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        if let NodeKind::AskCatalogQuestion { max_retries, .. } = &mut self.kind {
            *max_retries = Some(retries);
        }
        self
    }

    /// Override the validation rules of a catalog-question node.
    pub fn with_rules(mut self, rules: Vec<ValidationRule>) -> Self {
        if let NodeKind::AskCatalogQuestion {
            validation_rules, ..
        } = &mut self.kind
        {
            *validation_rules = rules;
        }
        self
    }

    /// Set the tool list of an LLM node.
    pub fn with_tools(mut self, names: Vec<String>) -> Self {
        if let NodeKind::Llm { tools, .. } = &mut self.kind {
            *tools = names;
        }
        self
    }

    /// Set the input keys of a human-interaction node.
    pub fn with_input_keys(mut self, keys: Vec<String>) -> Self {
        if let NodeKind::HumanInteraction { input_keys, .. } = &mut self.kind {
            *input_keys = keys;
        }
        self
    }

    /// Set the expected output and output key of a system-command node.
    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        if let NodeKind::SystemCommand {
            expected_output, ..
        } = &mut self.kind
        {
            *expected_output = Some(expected.into());
        }
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        if let NodeKind::SystemCommand { output_key, .. } = &mut self.kind {
            *output_key = Some(key.into());
        }
        self
    }

    /// The snake_case type tag.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Llm { .. } => "llm",
            NodeKind::Conditional { .. } => "conditional",
            NodeKind::HumanInteraction { .. } => "human_interaction",
            NodeKind::Aggregation { .. } => "aggregation",
            NodeKind::SystemCommand { .. } => "system_command",
            NodeKind::GetQuestion { .. } => "get_question",
            NodeKind::AskCatalogQuestion { .. } => "ask_catalog_question",
            NodeKind::ValidateAnswer { .. } => "validate_answer",
            NodeKind::Approval { .. } => "approval",
        }
    }

    /// Key this node writes into the run's variables, if any.
    pub fn output_key(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Llm { output_key, .. }
            | NodeKind::HumanInteraction { output_key, .. }
            | NodeKind::Aggregation { output_key, .. }
            | NodeKind::GetQuestion { output_key, .. }
            | NodeKind::AskCatalogQuestion { output_key, .. }
            | NodeKind::Approval { output_key, .. } => Some(output_key),
            NodeKind::SystemCommand { output_key, .. } => output_key.as_deref(),
            _ => None,
        }
    }

    /// Declared failure path, if any.
    pub fn failure_target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::SystemCommand { on_failure, .. }
            | NodeKind::AskCatalogQuestion { on_failure, .. }
            | NodeKind::ValidateAnswer { on_failure, .. } => on_failure.as_deref(),
            NodeKind::Approval { on_reject, .. } => on_reject.as_deref(),
            _ => None,
        }
    }

    /// Node ids this node can jump to directly, bypassing the edge list.
    pub fn jump_targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        if let NodeKind::Conditional {
            if_true, if_false, ..
        } = &self.kind
        {
            targets.extend(if_true.as_deref());
            targets.extend(if_false.as_deref());
        }
        targets.extend(self.failure_target());
        targets
    }

    /// Whether executing this node can suspend the run for a human answer.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::HumanInteraction { .. }
                | NodeKind::AskCatalogQuestion { .. }
                | NodeKind::Approval { .. }
        )
    }

    /// Label recorded with this node's decisions.
    pub fn label(&self) -> &str {
        if self.description.is_empty() {
            &self.id
        } else {
            &self.description
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builders() {
        let node = WorkflowNode::llm("draft", "Write a plan for {{feature}}", "plan")
            .with_description("Draft the plan")
            .with_tools(vec!["read_file".into()]);

        assert_eq!(node.id, "draft");
        assert_eq!(node.type_name(), "llm");
        assert_eq!(node.output_key(), Some("plan"));
        assert_eq!(node.label(), "Draft the plan");
        match node.kind {
            NodeKind::Llm { tools, .. } => assert_eq!(tools, vec!["read_file"]),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_failure_target_per_type() {
        let cmd = WorkflowNode::command("test", "cargo test").with_failure_target("fix");
        assert_eq!(cmd.failure_target(), Some("fix"));

        let approval = WorkflowNode::approval("ok", "Ship it?", "approved")
            .with_failure_target("rework");
        assert_eq!(approval.failure_target(), Some("rework"));

        let llm = WorkflowNode::llm("l", "p", "o").with_failure_target("ignored");
        assert_eq!(llm.failure_target(), None);
    }

    #[test]
    fn test_jump_targets() {
        let node = WorkflowNode::conditional("c", "ready", "yes", "no");
        assert_eq!(node.jump_targets(), vec!["yes", "no"]);

        let node = WorkflowNode::catalog_question("q", "Q1", "answer").with_failure_target("f");
        assert_eq!(node.jump_targets(), vec!["f"]);
    }

    #[test]
    fn test_interactive_nodes() {
        assert!(WorkflowNode::human("h", "Name?", "name").is_interactive());
        assert!(WorkflowNode::catalog_question("q", "Q1", "a").is_interactive());
        assert!(WorkflowNode::approval("a", "Ok?", "ok").is_interactive());
        assert!(!WorkflowNode::llm("l", "p", "o").is_interactive());
    }

    #[test]
    fn test_deserialize_tagged() {
        let json = r#"{
            "id": "ask",
            "type": "ask_catalog_question",
            "question_id": "Q-SCOPE",
            "output_key": "scope",
            "max_retries": 2,
            "validation_rules": [{"rule": "min_length", "min": 10}],
            "on_failure": "escalate"
        }"#;
        let node: WorkflowNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.type_name(), "ask_catalog_question");
        assert_eq!(node.failure_target(), Some("escalate"));
        match node.kind {
            NodeKind::AskCatalogQuestion {
                max_retries,
                validation_rules,
                ..
            } => {
                assert_eq!(max_retries, Some(2));
                assert_eq!(validation_rules.len(), 1);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_missing_fields_left_for_validation() {
        let node: WorkflowNode =
            serde_json::from_str(r#"{"id": "c", "type": "conditional", "condition": "x"}"#)
                .unwrap();
        assert!(node.jump_targets().is_empty());

        let node: WorkflowNode = serde_json::from_str(r#"{"id": "l", "type": "llm"}"#).unwrap();
        match node.kind {
            NodeKind::Llm { prompt, .. } => assert!(prompt.is_empty()),
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
