//! The agent seam: every LLM-backed collaborator is an opaque
//! request/response black box behind one narrow trait.
//!
//! The core is written against `Agent` only, which keeps the transport
//! replaceable and makes the pipeline unit-testable against scripted stubs
//! that return deterministic payloads.

pub mod cli;
pub mod stub;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::AgentError;

/// Model and sampling configuration for one agent call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            temperature: 0.2,
            max_tokens: 8192,
        }
    }
}

/// A fully composed prompt: system text, user text, the schema the response
/// must conform to, and the agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSpec {
    pub system: String,
    pub user: String,
    pub response_schema: serde_json::Value,
    pub config: AgentConfig,
}

impl PromptSpec {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            response_schema: serde_json::Value::Null,
            config: AgentConfig::default(),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = schema;
        self
    }
}

/// A structured agent response: a JSON object conforming to the declared
/// schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse(pub serde_json::Value);

impl AgentResponse {
    pub fn json(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Interpret the response as a coder-style structured result, mapping an
    /// explicit `{result: "error"|"issue"}` payload to the matching error.
    pub fn into_structured_result(self) -> Result<StructuredResult, AgentError> {
        let result: StructuredResult = serde_json::from_value(self.0)
            .map_err(|e| AgentError::SchemaMismatch(e.to_string()))?;
        match result.result {
            ResultKind::Success => Ok(result),
            ResultKind::Error => Err(AgentError::Payload(result.message)),
            ResultKind::Issue => Err(AgentError::Issue(result.message)),
        }
    }
}

/// Outcome discriminator of a structured agent result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Success,
    Error,
    Issue,
}

/// The `{result, message}` payload agents emit after performing work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredResult {
    pub result: ResultKind,
    #[serde(default)]
    pub message: String,
}

/// An opaque LLM-backed collaborator.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn prompt(&self, spec: &PromptSpec) -> Result<AgentResponse, AgentError>;
}

/// The specialized agents the pipeline coordinates. All share the same trait;
/// the roles differ only in how their prompts are composed.
#[derive(Clone)]
pub struct AgentSet {
    /// Decomposes a PRD into a backlog
    pub architect: Arc<dyn Agent>,
    /// Generates per-subtask blueprints
    pub researcher: Arc<dyn Agent>,
    /// Executes blueprints against the working tree
    pub coder: Arc<dyn Agent>,
    /// Reviews a finished scope for bugs
    pub qa: Arc<dyn Agent>,
}

impl AgentSet {
    /// All four roles served by the same agent.
    pub fn uniform(agent: Arc<dyn Agent>) -> Self {
        Self {
            architect: Arc::clone(&agent),
            researcher: Arc::clone(&agent),
            coder: Arc::clone(&agent),
            qa: agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_result_success() {
        let response = AgentResponse(json!({"result": "success", "message": "done"}));
        let result = response.into_structured_result().unwrap();
        assert_eq!(result.result, ResultKind::Success);
        assert_eq!(result.message, "done");
    }

    #[test]
    fn test_structured_result_error_is_payload_error() {
        let response = AgentResponse(json!({"result": "error", "message": "tests failed"}));
        match response.into_structured_result() {
            Err(AgentError::Payload(msg)) => assert_eq!(msg, "tests failed"),
            other => panic!("expected payload error, got {other:?}"),
        }
    }

    #[test]
    fn test_structured_result_issue_is_terminal() {
        let response = AgentResponse(json!({"result": "issue", "message": "needs a human"}));
        let err = response.into_structured_result().unwrap_err();
        assert!(matches!(err, AgentError::Issue(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_structured_result_unknown_kind_is_schema_mismatch() {
        let response = AgentResponse(json!({"result": "partial", "message": ""}));
        assert!(matches!(
            response.into_structured_result(),
            Err(AgentError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_prompt_spec_builder() {
        let spec = PromptSpec::new("system", "user").with_schema(json!({"type": "object"}));
        assert_eq!(spec.system, "system");
        assert_eq!(spec.response_schema["type"], "object");
    }
}
