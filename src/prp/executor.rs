//! Coder execution with retry.
//!
//! The coder agent receives the blueprint path, performs its work through
//! the MCP toolchain, and emits a structured `{result, message}` payload.
//! Plain `error` results and transport failures retry with exponential
//! backoff and jitter; an `issue` result is terminal and surfaced for
//! inspection.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::{Agent, PromptSpec, StructuredResult};
use crate::config::RunnerConfig;
use crate::errors::{AgentError, PrpError};
use crate::model::Subtask;
use crate::orchestrator::cancel::CancelToken;
use crate::prp::gates::GateOutcome;
use crate::prp::jittered;

/// Drives coder prompts for initial execution and gate-failure fixes.
pub struct CoderExecutor {
    coder: Arc<dyn Agent>,
    config: RunnerConfig,
}

impl CoderExecutor {
    pub fn new(coder: Arc<dyn Agent>, config: RunnerConfig) -> Self {
        Self { coder, config }
    }

    /// Execute the blueprint for `subtask`.
    pub async fn execute(
        &self,
        subtask: &Subtask,
        blueprint_path: &Path,
        cancel: &CancelToken,
    ) -> Result<StructuredResult, PrpError> {
        let spec = self.execution_prompt(subtask, blueprint_path, None, 0);
        self.prompt_with_retry(subtask, spec, cancel).await
    }

    /// Re-run the coder with the failing gate's output as added context.
    pub async fn execute_fix(
        &self,
        subtask: &Subtask,
        blueprint_path: &Path,
        failed_gate: &GateOutcome,
        fix_attempt: u32,
        cancel: &CancelToken,
    ) -> Result<StructuredResult, PrpError> {
        let spec =
            self.execution_prompt(subtask, blueprint_path, Some(failed_gate), fix_attempt);
        self.prompt_with_retry(subtask, spec, cancel).await
    }

    async fn prompt_with_retry(
        &self,
        subtask: &Subtask,
        spec: PromptSpec,
        cancel: &CancelToken,
    ) -> Result<StructuredResult, PrpError> {
        let subtask_id = subtask.id.to_string();
        let mut last_error = String::new();

        for attempt in 0..self.config.coder_attempts {
            if attempt > 0 {
                let delay = jittered(
                    self.config.backoff_delay(attempt - 1),
                    self.config.retry_jitter,
                );
                debug!(subtask = %subtask_id, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(PrpError::Cancelled(subtask_id)),
                }
            }
            if cancel.is_cancelled() {
                return Err(PrpError::Cancelled(subtask_id));
            }

            let response = tokio::select! {
                r = self.coder.prompt(&spec) => r,
                _ = cancel.cancelled() => return Err(PrpError::Cancelled(subtask_id)),
            };

            match response.and_then(|r| r.into_structured_result()) {
                Ok(result) => {
                    info!(subtask = %subtask_id, attempt, "coder reported success");
                    return Ok(result);
                }
                Err(AgentError::Issue(message)) => {
                    // The caller must inspect; replaying the same prompt will
                    // not resolve an issue result.
                    warn!(subtask = %subtask_id, %message, "coder surfaced an issue");
                    return Err(PrpError::CoderExecution {
                        subtask: subtask_id,
                        reason: format!("issue: {message}"),
                    });
                }
                Err(e) => {
                    warn!(subtask = %subtask_id, attempt, error = %e, "coder attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(PrpError::CoderExecution {
            subtask: subtask_id,
            reason: format!(
                "{} attempts exhausted: {last_error}",
                self.config.coder_attempts
            ),
        })
    }

    fn execution_prompt(
        &self,
        subtask: &Subtask,
        blueprint_path: &Path,
        failed_gate: Option<&GateOutcome>,
        fix_attempt: u32,
    ) -> PromptSpec {
        let mut user = format!(
            "Implement subtask {} following the blueprint at {}.\n\
             Use the available tools (bash__run, filesystem__read, filesystem__write, \
             git__status) to read the blueprint, apply the changes, and verify them.",
            subtask.id,
            blueprint_path.display()
        );
        if let Some(gate) = failed_gate {
            user.push_str(&format!(
                "\n\n## PREVIOUS VALIDATION FAILURE (fix attempt {fix_attempt})\n{}\n\
                 Fix the underlying problem, then stop; validation re-runs from this gate.",
                gate.failure_context()
            ));
        }

        PromptSpec::new(
            "You are a coder agent. Perform the work described by the blueprint and \
             report a structured result.",
            user,
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "required": ["result"],
            "properties": {
                "result": { "enum": ["success", "error", "issue"] },
                "message": { "type": "string" }
            }
        }))
    }
}
