use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::Decision;

/// Area a vibe check looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VibeCheckCategory {
    Requirements,
    Architecture,
    CodeQuality,
    Testing,
    Security,
    Documentation,
    #[default]
    General,
}

impl std::fmt::Display for VibeCheckCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Requirements => "requirements",
            Self::Architecture => "architecture",
            Self::CodeQuality => "code_quality",
            Self::Testing => "testing",
            Self::Security => "security",
            Self::Documentation => "documentation",
            Self::General => "general",
        };
        write!(f, "{}", name)
    }
}

/// A quality-gate question evaluated after a phase's workflow completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibeCheck {
    pub question: String,
    #[serde(default)]
    pub category: VibeCheckCategory,
    /// Required checks block phase advancement when they fail.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl VibeCheck {
    pub fn required(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            category: VibeCheckCategory::General,
            required: true,
        }
    }

    pub fn optional(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            category: VibeCheckCategory::General,
            required: false,
        }
    }

    pub fn with_category(mut self, category: VibeCheckCategory) -> Self {
        self.category = category;
        self
    }
}

/// Outcome of evaluating one vibe check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibeCheckResult {
    pub check: VibeCheck,
    pub passed: bool,
    #[serde(default)]
    pub findings: String,
    pub evaluated_at: DateTime<Utc>,
}

impl VibeCheckResult {
    pub fn new(check: VibeCheck, passed: bool, findings: impl Into<String>) -> Self {
        Self {
            check,
            passed,
            findings: findings.into(),
            evaluated_at: Utc::now(),
        }
    }

    /// A failure that blocks advancement.
    pub fn is_blocking(&self) -> bool {
        self.check.required && !self.passed
    }
}

/// What an evaluator gets to look at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VibeCheckContext {
    pub phase_name: String,
    pub project_path: String,
    pub branch: String,
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

impl VibeCheckContext {
    /// Render the context as text for prompts and console display.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Phase: {}\nProject: {} ({})\n\nSummary:\n{}\n",
            self.phase_name, self.project_path, self.branch, self.summary
        );
        if !self.decisions.is_empty() {
            out.push_str("\nDecisions:\n");
            for d in &self.decisions {
                out.push_str(&format!("- [{}] {}: {}\n", d.node_id, d.description, d.output));
            }
        }
        out
    }
}

/// Pass/fail aggregation over a phase's vibe-check results.
#[derive(Debug, Clone, PartialEq)]
pub struct GateSummary {
    /// True when every required check passed. Optional failures never block.
    pub passed: bool,
    pub required_failures: Vec<String>,
    pub optional_failures: Vec<String>,
}

impl GateSummary {
    pub fn from_results(results: &[VibeCheckResult]) -> Self {
        let required_failures: Vec<String> = results
            .iter()
            .filter(|r| r.is_blocking())
            .map(|r| r.check.question.clone())
            .collect();
        let optional_failures = results
            .iter()
            .filter(|r| !r.check.required && !r.passed)
            .map(|r| r.check.question.clone())
            .collect();

        Self {
            passed: required_failures.is_empty(),
            required_failures,
            optional_failures,
        }
    }
}
