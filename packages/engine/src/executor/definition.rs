// packages/engine/src/executor/definition.rs
//! Workflow definition files
//!
//! A workflow can be described in YAML or JSON:
//!
//! ```text
//! name: release
//! description: build and verify
//! options:
//!   failure_policy: skip_dependents
//! tasks:
//!   - id: build
//!     capability: build
//!   - id: review
//!     capability: review
//!     dependencies: [build]
//!     consensus: { participants: 3, strategy: majority }
//! ```

use crate::executor::graph;
use crate::executor::workflow::{TaskDefinition, WorkflowOptions};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_created_by() -> String {
    "conductor".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_created_by")]
    pub created_by: String,
    #[serde(default)]
    pub options: WorkflowOptions,
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    /// Parse a YAML document; a leading `---` separator is accepted
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(yaml.trim_start_matches("---").trim())?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let definition: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Validation(format!("invalid workflow JSON: {}", e)))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Load from a file, picking the format from its extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            other => Err(EngineError::Validation(format!(
                "unsupported workflow file extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Check the task graph without registering anything
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("workflow name cannot be empty".to_string()));
        }
        graph::validate(&self.tasks)?;
        Ok(())
    }
}
