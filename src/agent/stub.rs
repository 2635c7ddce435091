//! Deterministic test doubles for the agent seam.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{Agent, AgentResponse, PromptSpec};
use crate::errors::AgentError;

/// An agent that replays a scripted sequence of responses and records every
/// prompt it receives.
///
/// When the script runs dry the fallback response (if any) is returned; with
/// no fallback, further calls fail with a transport error so a test that
/// over-consumes its script fails loudly.
pub struct ScriptedAgent {
    script: Mutex<VecDeque<Result<serde_json::Value, AgentError>>>,
    fallback: Option<serde_json::Value>,
    calls: Mutex<Vec<PromptSpec>>,
}

impl ScriptedAgent {
    /// Always respond with `value`.
    pub fn always(value: serde_json::Value) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(value),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Respond with each script entry once, in order.
    pub fn script(entries: Vec<Result<serde_json::Value, AgentError>>) -> Self {
        Self {
            script: Mutex::new(entries.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Respond with each script entry once, then with `fallback` forever.
    pub fn script_then(
        entries: Vec<Result<serde_json::Value, AgentError>>,
        fallback: serde_json::Value,
    ) -> Self {
        Self {
            script: Mutex::new(entries.into()),
            fallback: Some(fallback),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn calls(&self) -> Vec<PromptSpec> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn prompt(&self, spec: &PromptSpec) -> Result<AgentResponse, AgentError> {
        self.calls.lock().expect("calls lock").push(spec.clone());
        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(entry) => entry.map(AgentResponse),
            None => match &self.fallback {
                Some(value) => Ok(AgentResponse(value.clone())),
                None => Err(AgentError::Transport(
                    "scripted agent exhausted its responses".to_string(),
                )),
            },
        }
    }
}
