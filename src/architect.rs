//! PRD decomposition via the architect agent.
//!
//! The architect is an opaque collaborator that turns a PRD into the
//! four-level backlog. Its response must parse and validate under the
//! `tasks.json` schema; schema failures retry a bounded number of times.

use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::{Agent, PromptSpec};
use crate::config::RunnerConfig;
use crate::errors::{AgentError, PrpError};
use crate::model::{Backlog, validate_backlog};

/// Decompose `prd_text` into a validated backlog.
pub async fn decompose_prd(
    architect: Arc<dyn Agent>,
    prd_text: &str,
    config: &RunnerConfig,
) -> Result<Backlog, PrpError> {
    let spec = PromptSpec::new(
        "You are an architect agent. Decompose the PRD into a backlog of phases, \
         milestones, tasks, and subtasks. Ids follow P<n>.M<n>.T<n>.S<n>; every \
         subtask carries story points (1-21), dependencies, and a CONTRACT \
         DEFINITION block.",
        format!("## PRD\n\n{prd_text}"),
    )
    .with_schema(backlog_schema());

    let mut last_error = String::new();
    for attempt in 0..config.blueprint_attempts {
        match architect.prompt(&spec).await {
            Ok(response) => {
                match serde_json::from_value::<Backlog>(response.0)
                    .map_err(|e| AgentError::SchemaMismatch(e.to_string()))
                    .and_then(|backlog| {
                        validate_backlog(&backlog)
                            .map_err(|e| AgentError::SchemaMismatch(e.to_string()))?;
                        Ok(backlog)
                    }) {
                    Ok(backlog) => {
                        info!(
                            attempt,
                            items = backlog.item_count(),
                            "architect produced a valid backlog"
                        );
                        return Ok(backlog);
                    }
                    Err(e) => {
                        debug!(attempt, error = %e, "architect response rejected");
                        last_error = e.to_string();
                    }
                }
            }
            Err(e) if e.is_retryable() => last_error = e.to_string(),
            Err(e) => return Err(e.into()),
        }
    }

    Err(PrpError::BlueprintGeneration {
        subtask: "<backlog>".to_string(),
        attempts: config.blueprint_attempts,
        reason: last_error,
    })
}

/// The complete `tasks.json` shape, inlined so the opaque architect gets the
/// full contract for every nesting level in one self-contained document.
fn backlog_schema() -> serde_json::Value {
    let status = serde_json::json!({
        "enum": [
            "Planned",
            "Researching",
            "Implementing",
            "Validating",
            "Complete",
            "Failed",
            "Blocked"
        ]
    });
    let subtask = serde_json::json!({
        "type": "object",
        "required": ["id", "type", "title", "status", "story_points", "dependencies", "context_scope"],
        "properties": {
            "id": { "type": "string", "pattern": "^P[1-9]\\d*\\.M[1-9]\\d*\\.T[1-9]\\d*\\.S[1-9]\\d*$" },
            "type": { "const": "Subtask" },
            "title": { "type": "string", "minLength": 1, "maxLength": 200 },
            "status": status.clone(),
            "story_points": { "type": "integer", "minimum": 1, "maximum": 21 },
            "dependencies": { "type": "array", "items": { "type": "string" } },
            "context_scope": {
                "type": "string",
                "description": "CONTRACT DEFINITION block: header line, then numbered RESEARCH NOTE / INPUT / LOGIC / OUTPUT sections"
            }
        }
    });
    let task = serde_json::json!({
        "type": "object",
        "required": ["id", "type", "title", "status", "description", "subtasks"],
        "properties": {
            "id": { "type": "string", "pattern": "^P[1-9]\\d*\\.M[1-9]\\d*\\.T[1-9]\\d*$" },
            "type": { "const": "Task" },
            "title": { "type": "string", "minLength": 1, "maxLength": 200 },
            "status": status.clone(),
            "description": { "type": "string" },
            "subtasks": { "type": "array", "items": subtask }
        }
    });
    let milestone = serde_json::json!({
        "type": "object",
        "required": ["id", "type", "title", "status", "description", "tasks"],
        "properties": {
            "id": { "type": "string", "pattern": "^P[1-9]\\d*\\.M[1-9]\\d*$" },
            "type": { "const": "Milestone" },
            "title": { "type": "string", "minLength": 1, "maxLength": 200 },
            "status": status.clone(),
            "description": { "type": "string" },
            "tasks": { "type": "array", "items": task }
        }
    });
    let phase = serde_json::json!({
        "type": "object",
        "required": ["id", "type", "title", "status", "description", "milestones"],
        "properties": {
            "id": { "type": "string", "pattern": "^P[1-9]\\d*$" },
            "type": { "const": "Phase" },
            "title": { "type": "string", "minLength": 1, "maxLength": 200 },
            "status": status,
            "description": { "type": "string" },
            "milestones": { "type": "array", "items": milestone }
        }
    });
    serde_json::json!({
        "type": "object",
        "required": ["backlog"],
        "properties": {
            "backlog": { "type": "array", "items": phase }
        }
    })
}
