use std::path::Path;

use serde::{Deserialize, Serialize};

use phaseflow_core::catalog::CatalogQuestion;
use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::process::EngineeringProcess;

use crate::graph::WorkflowTemplate;

/// A process together with the templates its phases run and the catalog
/// questions those templates ask. The unit the CLI loads from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessBundle {
    pub process: EngineeringProcess,
    pub templates: Vec<WorkflowTemplate>,
    #[serde(default)]
    pub questions: Vec<CatalogQuestion>,
}

impl ProcessBundle {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let bundle: Self = serde_json::from_str(&content)?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Validate the process, every template, and that each phase's workflow
    /// is one of the bundled templates.
    pub fn validate(&self) -> Result<()> {
        self.process.validate()?;
        for template in &self.templates {
            template.validate()?;
        }
        for phase in &self.process.phases {
            if !self.templates.iter().any(|t| t.name == phase.workflow) {
                return Err(PhaseflowError::InvalidProcess {
                    process: self.process.id.clone(),
                    reason: format!(
                        "phase '{}' references unknown workflow '{}'",
                        phase.name, phase.workflow
                    ),
                });
            }
        }
        Ok(())
    }
}
