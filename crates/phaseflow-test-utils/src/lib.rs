//! Scripted collaborators and fixtures shared by phaseflow tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use phaseflow_core::catalog::{CatalogQuestion, ValidationRule};
use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::{
    CommandOutput, CommandRunner, ConditionEvaluator, LlmClient, QuestionCatalog,
    VibeCheckEvaluator,
};
use phaseflow_core::vibe::{VibeCheck, VibeCheckContext, VibeCheckResult};

enum LlmMode {
    Scripted(Mutex<VecDeque<String>>),
    Echo,
    Failing(String),
}

/// LLM that replays canned completions and records every prompt.
///
/// Once the script runs out it echoes prompts back.
pub struct ScriptedLlm {
    mode: LlmMode,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            mode: LlmMode::Scripted(Mutex::new(
                responses.into_iter().map(String::from).collect(),
            )),
            delay: None,
            prompts: Mutex::new(vec![]),
        }
    }

    /// Completes every prompt with the prompt itself.
    pub fn echo() -> Self {
        Self {
            mode: LlmMode::Echo,
            delay: None,
            prompts: Mutex::new(vec![]),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            mode: LlmMode::Failing(message.to_string()),
            delay: None,
            prompts: Mutex::new(vec![]),
        }
    }

    /// Sleep for `delay` after recording each prompt, before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
        _tools: &'a [String],
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.mode {
                LlmMode::Scripted(responses) => Ok(responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| prompt.to_string())),
                LlmMode::Echo => Ok(prompt.to_string()),
                LlmMode::Failing(message) => Err(PhaseflowError::Llm(message.clone())),
            }
        })
    }
}

#[derive(Default)]
pub struct ScriptedCatalog {
    questions: HashMap<String, CatalogQuestion>,
}

impl ScriptedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_question(mut self, id: &str, text: &str, rules: Vec<ValidationRule>) -> Self {
        self.questions
            .insert(id.to_string(), fixtures::catalog_question(id, text, rules));
        self
    }
}

impl QuestionCatalog for ScriptedCatalog {
    fn get_question<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<CatalogQuestion>> {
        Box::pin(async move {
            self.questions
                .get(id)
                .cloned()
                .ok_or_else(|| PhaseflowError::Catalog(format!("unknown question '{}'", id)))
        })
    }
}

/// Command runner that succeeds with "ok" unless told otherwise.
#[derive(Default)]
pub struct ScriptedCommandRunner {
    failures: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `command` fail with `output`.
    pub fn fail_on(&self, command: &str, output: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(command.to_string(), output.to_string());
    }

    /// Commands run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            self.commands.lock().unwrap().push(command.to_string());
            match self.failures.lock().unwrap().get(command) {
                Some(output) => Ok(CommandOutput::failure(output.clone())),
                None => Ok(CommandOutput::success("ok")),
            }
        })
    }
}

/// Conditions with fixed answers; unknown expressions are false.
#[derive(Default)]
pub struct ScriptedConditions {
    answers: HashMap<String, bool>,
}

impl ScriptedConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, expr: &str, value: bool) -> Self {
        self.answers.insert(expr.to_string(), value);
        self
    }
}

impl ConditionEvaluator for ScriptedConditions {
    fn evaluate<'a>(
        &'a self,
        expr: &'a str,
        _variables: &'a HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.answers.get(expr).copied().unwrap_or(false)) })
    }
}

/// Vibe-check evaluator with a verdict per question; anything not listed
/// gets the default verdict.
pub struct FixedVibeEvaluator {
    default_pass: bool,
    verdicts: HashMap<String, (bool, String)>,
}

impl FixedVibeEvaluator {
    pub fn passing() -> Self {
        Self {
            default_pass: true,
            verdicts: HashMap::new(),
        }
    }

    pub fn failing() -> Self {
        Self {
            default_pass: false,
            verdicts: HashMap::new(),
        }
    }

    pub fn with_verdict(mut self, question: &str, passed: bool, findings: &str) -> Self {
        self.verdicts
            .insert(question.to_string(), (passed, findings.to_string()));
        self
    }
}

impl VibeCheckEvaluator for FixedVibeEvaluator {
    fn evaluate<'a>(
        &'a self,
        check: &'a VibeCheck,
        _context: &'a VibeCheckContext,
    ) -> BoxFuture<'a, Result<VibeCheckResult>> {
        Box::pin(async move {
            let (passed, findings) = self
                .verdicts
                .get(&check.question)
                .cloned()
                .unwrap_or((self.default_pass, String::new()));
            Ok(VibeCheckResult::new(check.clone(), passed, findings))
        })
    }
}

pub mod fixtures {
    use phaseflow_core::catalog::{CatalogQuestion, ValidationRule};
    use phaseflow_core::process::{EngineeringProcess, ProcessPhase};
    use phaseflow_core::vibe::VibeCheck;

    pub fn phase(name: &str, workflow: &str, order: usize, checks: Vec<VibeCheck>) -> ProcessPhase {
        ProcessPhase {
            name: name.to_string(),
            description: String::new(),
            workflow: workflow.to_string(),
            vibe_checks: checks,
            order,
        }
    }

    pub fn process(id: &str, phases: Vec<ProcessPhase>) -> EngineeringProcess {
        EngineeringProcess {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            phases,
        }
    }

    pub fn catalog_question(id: &str, text: &str, rules: Vec<ValidationRule>) -> CatalogQuestion {
        CatalogQuestion {
            id: id.to_string(),
            text: text.to_string(),
            category: "general".to_string(),
            validation_rules: rules,
        }
    }

    /// JSON for `start -> llm1 -> ... -> llmN -> end`, one LLM node per
    /// prompt with output keys `out1..outN`.
    pub fn linear_template_json(name: &str, prompts: &[&str]) -> String {
        let mut ids = vec!["start".to_string()];
        let mut nodes = vec![serde_json::json!({"id": "start", "type": "start"})];
        for (i, prompt) in prompts.iter().enumerate() {
            let id = format!("llm{}", i + 1);
            nodes.push(serde_json::json!({
                "id": id,
                "type": "llm",
                "prompt": prompt,
                "output_key": format!("out{}", i + 1),
            }));
            ids.push(id);
        }
        nodes.push(serde_json::json!({"id": "end", "type": "end"}));
        ids.push("end".to_string());

        let edges: Vec<serde_json::Value> = ids
            .windows(2)
            .map(|w| serde_json::json!({"from": w[0], "to": w[1]}))
            .collect();

        serde_json::json!({
            "name": name,
            "nodes": nodes,
            "graph": {"start": "start", "end": "end", "edges": edges},
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_llm_then_echo() {
        let llm = ScriptedLlm::new(vec!["first"]);
        assert_eq!(llm.complete("a", &[]).await.unwrap(), "first");
        assert_eq!(llm.complete("b", &[]).await.unwrap(), "b");
        assert_eq!(llm.prompts(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_command_failures() {
        let runner = ScriptedCommandRunner::new();
        runner.fail_on("make", "broken");
        assert!(runner.run("ls").await.unwrap().success);
        let out = runner.run("make").await.unwrap();
        assert!(!out.success);
        assert_eq!(out.output, "broken");
        assert_eq!(runner.commands(), vec!["ls", "make"]);
    }

    #[test]
    fn test_linear_template_json() {
        let json = fixtures::linear_template_json("t", &["p1", "p2"]);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(value["graph"]["edges"].as_array().unwrap().len(), 3);
    }
}
