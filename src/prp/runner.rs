//! The per-subtask PRP pipeline: generate → execute → validate → commit.
//!
//! Stages run strictly sequentially. A checkpoint is written at each stage
//! boundary so a crash loses at most one in-flight stage; on gate failure
//! the runtime enters fix-retry (failure context back to the coder, re-run
//! from the failing gate forward) under a per-subtask budget.

use std::path::PathBuf;
use tracing::{info, warn};

use crate::agent::AgentSet;
use crate::config::RunnerConfig;
use crate::errors::PrpError;
use crate::model::{Backlog, ItemId, Subtask};
use crate::orchestrator::cancel::CancelToken;
use crate::prp::checkpoint::{
    CheckpointError, CheckpointManager, CheckpointState, GateRecord, Stage, state_at,
};
use crate::prp::executor::CoderExecutor;
use crate::prp::gates::GateRunner;
use crate::prp::generator::{BlueprintGenerator, GeneratedBlueprint};
use crate::session::Session;

/// What happened to one subtask that made it through the pipeline.
#[derive(Debug, Clone)]
pub struct SubtaskOutcome {
    pub subtask: ItemId,
    pub blueprint_path: PathBuf,
    pub cache_hit: bool,
    pub gates: Vec<GateRecord>,
    pub fix_attempts: u32,
    /// Commit id when the commit step produced one
    pub commit: Option<String>,
    /// Commit failure is non-fatal; the message is reported here
    pub commit_error: Option<String>,
}

/// Per-subtask runtime coordinating the researcher, the coder, the gates,
/// and the commit step.
pub struct PrpRuntime {
    generator: BlueprintGenerator,
    coder: CoderExecutor,
    gate_runner: GateRunner,
    config: RunnerConfig,
    project_dir: PathBuf,
}

impl PrpRuntime {
    pub fn new(agents: &AgentSet, project_dir: &std::path::Path, config: RunnerConfig) -> Self {
        Self {
            generator: BlueprintGenerator::new(agents.researcher.clone(), config.clone()),
            coder: CoderExecutor::new(agents.coder.clone(), config.clone()),
            gate_runner: GateRunner::new(project_dir, config.clone()),
            config,
            project_dir: project_dir.to_path_buf(),
        }
    }

    /// Blueprint generation stage (the subtask is `Researching`).
    pub async fn generate(
        &self,
        session: &Session,
        backlog: &Backlog,
        subtask: &Subtask,
        cancel: &CancelToken,
    ) -> Result<GeneratedBlueprint, PrpError> {
        self.generator
            .generate(session, backlog, subtask, cancel)
            .await
    }

    /// Execution + validation + commit (the subtask is `Implementing`).
    pub async fn execute_and_validate(
        &self,
        session: &Session,
        subtask: &Subtask,
        generated: &GeneratedBlueprint,
        cancel: &CancelToken,
    ) -> Result<SubtaskOutcome, PrpError> {
        let subtask_id = subtask.id.to_string();
        let mut checkpoints = CheckpointManager::open(
            &session.checkpoints_path(&subtask.id),
            &subtask_id,
            self.config.checkpoint_retention,
        );

        checkpoints.record(
            "pre-execution",
            state_at(&generated.path, Stage::PreExecution),
            None,
        )?;

        if cancel.is_cancelled() {
            return self.cancelled(&mut checkpoints, &generated.path, &subtask_id, &[]);
        }

        // Coder execution.
        let coder_result = match self.coder.execute(subtask, &generated.path, cancel).await {
            Ok(result) => result,
            Err(PrpError::Cancelled(_)) => {
                return self.cancelled(&mut checkpoints, &generated.path, &subtask_id, &[]);
            }
            Err(e) => {
                let mut state = state_at(&generated.path, Stage::CoderResponse);
                state.coder_result = Some("error".to_string());
                checkpoints.record(
                    "coder execution failed",
                    state,
                    Some(CheckpointError {
                        message: e.to_string(),
                        code: None,
                    }),
                )?;
                return Err(e);
            }
        };
        let mut state = state_at(&generated.path, Stage::CoderResponse);
        state.coder_response = Some(coder_result.message.clone());
        state.coder_result = Some("success".to_string());
        checkpoints.record("coder-response", state, None)?;

        // Progressive validation with fix-retry.
        let mut gate_records: Vec<GateRecord> = Vec::new();
        let mut fix_attempts = 0u32;
        let mut gate_index = 0usize;
        while gate_index < generated.blueprint.validation_gates.len() {
            let gate = &generated.blueprint.validation_gates[gate_index];
            let outcome = self.gate_runner.run(gate, cancel).await;
            if outcome.cancelled {
                return self.cancelled(&mut checkpoints, &generated.path, &subtask_id, &gate_records);
            }
            gate_records.push(outcome.record());

            let stage = Stage::validation_gate(gate.level)
                .expect("gate levels are validated at blueprint parse");
            let mut state = state_at(&generated.path, stage);
            state.validation_results = gate_records.clone();
            state.fix_attempt = (fix_attempts > 0).then_some(fix_attempts);
            let error = (!outcome.passed).then(|| CheckpointError {
                message: outcome.failure_context(),
                code: Some(outcome.exit_code),
            });
            checkpoints.record(&format!("validation-gate-{}", gate.level), state, error)?;

            if outcome.passed {
                gate_index += 1;
                continue;
            }

            fix_attempts += 1;
            if fix_attempts > self.config.fix_attempts {
                warn!(subtask = %subtask_id, fix_attempts, "fix-retry budget exhausted");
                return Err(PrpError::FixBudgetExhausted {
                    subtask: subtask_id,
                    attempts: fix_attempts - 1,
                });
            }
            info!(
                subtask = %subtask_id,
                gate = gate.level,
                fix_attempt = fix_attempts,
                "gate failed, dispatching fix to coder"
            );
            match self
                .coder
                .execute_fix(subtask, &generated.path, &outcome, fix_attempts, cancel)
                .await
            {
                Ok(_) => {}
                Err(PrpError::Cancelled(_)) => {
                    return self.cancelled(
                        &mut checkpoints,
                        &generated.path,
                        &subtask_id,
                        &gate_records,
                    );
                }
                Err(e) => return Err(e),
            }
            // Re-run from the failing gate forward.
        }

        // Commit. Failure does not demote the subtask; it is reported.
        let (commit, commit_error) = if self.config.commit_enabled {
            match self.commit(subtask) {
                Ok(sha) => (sha, None),
                Err(e) => {
                    warn!(subtask = %subtask_id, error = %e, "commit step failed");
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        Ok(SubtaskOutcome {
            subtask: subtask.id.clone(),
            blueprint_path: generated.path.clone(),
            cache_hit: generated.cache_hit,
            gates: gate_records,
            fix_attempts,
            commit,
            commit_error,
        })
    }

    fn commit(&self, subtask: &Subtask) -> anyhow::Result<Option<String>> {
        let committer = crate::tools::GitCommitter::new(&self.project_dir)?;
        let sha = committer.commit_subtask(&subtask.id.to_string(), &subtask.title)?;
        if let Some(ref sha) = sha {
            info!(subtask = %subtask.id, commit = %sha, "committed subtask");
        }
        Ok(sha)
    }

    fn cancelled(
        &self,
        checkpoints: &mut CheckpointManager,
        prp_path: &std::path::Path,
        subtask_id: &str,
        gate_records: &[GateRecord],
    ) -> Result<SubtaskOutcome, PrpError> {
        let mut state: CheckpointState = state_at(prp_path, Stage::Cancelled);
        state.validation_results = gate_records.to_vec();
        checkpoints.record("cancelled", state, None)?;
        Err(PrpError::Cancelled(subtask_id.to_string()))
    }
}
