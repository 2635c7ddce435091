//! Blueprint (PRP) documents: the per-subtask implementation plan produced by
//! the researcher agent and consumed by the coder agent.
//!
//! Agent responses use camelCase field names on the wire; the markdown
//! rendering under `PRP/<subtask-id>.md` is what the coder actually reads.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::AgentError;

/// One of the four progressive validation gates. A gate without a command is
/// a manual gate and passes when non-gated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationGate {
    pub level: u8,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
}

/// A generated blueprint document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub objective: String,
    pub context: String,
    pub implementation_steps: Vec<String>,
    pub validation_gates: Vec<ValidationGate>,
    pub success_criteria: Vec<String>,
    pub references: Vec<String>,
}

impl Blueprint {
    /// Validate a researcher response against the blueprint schema.
    pub fn from_response(value: serde_json::Value) -> Result<Self, AgentError> {
        let blueprint: Blueprint = serde_json::from_value(value)
            .map_err(|e| AgentError::SchemaMismatch(e.to_string()))?;
        if blueprint.objective.trim().is_empty() {
            return Err(AgentError::SchemaMismatch("empty objective".into()));
        }
        if blueprint.implementation_steps.is_empty() {
            return Err(AgentError::SchemaMismatch("no implementation steps".into()));
        }
        if blueprint.validation_gates.len() != 4 {
            return Err(AgentError::SchemaMismatch(format!(
                "expected 4 validation gates, found {}",
                blueprint.validation_gates.len()
            )));
        }
        for (i, gate) in blueprint.validation_gates.iter().enumerate() {
            let expected = (i + 1) as u8;
            if gate.level != expected {
                return Err(AgentError::SchemaMismatch(format!(
                    "validation gate {} declares level {}",
                    expected, gate.level
                )));
            }
        }
        Ok(blueprint)
    }

    /// The response schema descriptor handed to the researcher agent.
    pub fn response_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "required": [
                "objective",
                "context",
                "implementationSteps",
                "validationGates",
                "successCriteria",
                "references"
            ],
            "properties": {
                "objective": { "type": "string" },
                "context": { "type": "string" },
                "implementationSteps": { "type": "array", "items": { "type": "string" } },
                "validationGates": {
                    "type": "array",
                    "minItems": 4,
                    "maxItems": 4,
                    "items": {
                        "type": "object",
                        "required": ["level"],
                        "properties": {
                            "level": { "type": "integer", "minimum": 1, "maximum": 4 },
                            "name": { "type": "string" },
                            "command": { "type": ["string", "null"] }
                        }
                    }
                },
                "successCriteria": { "type": "array", "items": { "type": "string" } },
                "references": { "type": "array", "items": { "type": "string" } }
            }
        })
    }

    /// Render the markdown representation written to `PRP/<subtask-id>.md`.
    pub fn to_markdown(&self, subtask_id: &str, title: &str) -> String {
        let mut doc = String::new();
        doc.push_str(&format!("# PRP: {subtask_id} — {title}\n\n"));
        doc.push_str("## Objective\n\n");
        doc.push_str(self.objective.trim());
        doc.push_str("\n\n## Context\n\n");
        doc.push_str(self.context.trim());
        doc.push_str("\n\n## Implementation Steps\n\n");
        for (i, step) in self.implementation_steps.iter().enumerate() {
            doc.push_str(&format!("{}. {}\n", i + 1, step.trim()));
        }
        doc.push_str("\n## Validation Gates\n\n");
        for gate in &self.validation_gates {
            let name = if gate.name.is_empty() {
                default_gate_name(gate.level)
            } else {
                gate.name.as_str()
            };
            match &gate.command {
                Some(command) => {
                    doc.push_str(&format!("{}. **{}**: `{}`\n", gate.level, name, command));
                }
                None => {
                    doc.push_str(&format!("{}. **{}**: manual\n", gate.level, name));
                }
            }
        }
        doc.push_str("\n## Success Criteria\n\n");
        for criterion in &self.success_criteria {
            doc.push_str(&format!("- {}\n", criterion.trim()));
        }
        doc.push_str("\n## References\n\n");
        for reference in &self.references {
            doc.push_str(&format!("- {}\n", reference.trim()));
        }
        doc
    }
}

fn default_gate_name(level: u8) -> &'static str {
    match level {
        1 => "Syntax and style",
        2 => "Unit tests",
        3 => "Integration tests",
        _ => "Manual review",
    }
}
