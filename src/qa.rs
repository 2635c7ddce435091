//! QA review and the bug-fix cycle.
//!
//! After a scope finishes, the QA agent reviews what was implemented. Each
//! reported bug becomes a fresh `Planned` fix subtask appended under the
//! affected task, and the fix subtasks are processed as scoped sub-runs of
//! the normal pipeline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::agent::{Agent, PromptSpec};
use crate::config::RunnerConfig;
use crate::errors::{AgentError, OrchestratorError};
use crate::model::{Backlog, ItemId, ItemLevel, Subtask};
use crate::orchestrator::cancel::CancelToken;
use crate::orchestrator::runner::{Orchestrator, RunSummary};
use crate::prp::PrpRuntime;
use crate::session::SessionManager;
use crate::util::truncate_chars;

/// One defect reported by the QA agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BugReport {
    pub title: String,
    #[serde(default)]
    pub detail: String,
    /// Task id the bug belongs under; defaults to the first task in scope
    #[serde(default)]
    pub affected_task: Option<String>,
}

/// QA verdict over a finished scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaReview {
    pub approved: bool,
    #[serde(default)]
    pub bugs: Vec<BugReport>,
}

/// Drives the QA agent over a finished run.
pub struct QaReviewer {
    qa: Arc<dyn Agent>,
}

impl QaReviewer {
    pub fn new(qa: Arc<dyn Agent>) -> Self {
        Self { qa }
    }

    pub async fn review(
        &self,
        summary: &RunSummary,
        backlog: &Backlog,
    ) -> Result<QaReview, AgentError> {
        let mut user = format!(
            "A scoped implementation run just finished: {} completed, {} failed, {} blocked.\n\
             Review the implemented subtasks for defects.\n\n## IMPLEMENTED SUBTASKS\n",
            summary.completed, summary.failed, summary.blocked
        );
        for subtask in backlog.subtasks() {
            user.push_str(&format!("- {} ({}): {}\n", subtask.id, subtask.status, subtask.title));
        }

        let spec = PromptSpec::new(
            "You are a QA agent. Inspect the implemented work and report any bugs \
             with the task they belong to.",
            user,
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "required": ["approved"],
            "properties": {
                "approved": { "type": "boolean" },
                "bugs": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["title"],
                        "properties": {
                            "title": { "type": "string" },
                            "detail": { "type": "string" },
                            "affectedTask": { "type": "string" }
                        }
                    }
                }
            }
        }));

        let response = self.qa.prompt(&spec).await?;
        serde_json::from_value(response.0).map_err(|e| AgentError::SchemaMismatch(e.to_string()))
    }
}

/// Turn QA bug reports into fix subtasks appended under their affected
/// tasks. Returns the updated backlog and the new subtask ids.
pub fn plan_fix_cycle(
    backlog: &Backlog,
    bugs: &[BugReport],
) -> Result<(Backlog, Vec<ItemId>), OrchestratorError> {
    let mut updated = backlog.clone();
    let mut new_ids = Vec::new();

    for bug in bugs {
        let task_id = bug
            .affected_task
            .as_deref()
            .and_then(|raw| ItemId::parse(raw).ok())
            .filter(|id| id.level() == ItemLevel::Task && backlog.find(id).is_some())
            .or_else(|| first_task_id(backlog))
            .ok_or_else(|| {
                OrchestratorError::ScopeNotFound("no task to attach fix subtask to".to_string())
            })?;

        let task = updated
            .backlog
            .iter_mut()
            .flat_map(|p| &mut p.milestones)
            .flat_map(|m| &mut m.tasks)
            .find(|t| t.id == task_id)
            .expect("task id was just resolved against this backlog");

        let next_index = task
            .subtasks
            .iter()
            .filter_map(|s| s.id.segment(3))
            .max()
            .unwrap_or(0)
            + 1;
        let id = task
            .id
            .child(next_index)
            .expect("task ids always admit a subtask child");

        let title = truncate_chars(&format!("Fix: {}", bug.title), 200);
        let contract = fix_contract(bug);
        task.subtasks.push(Subtask::new(id.clone(), &title, 2, &contract));
        info!(subtask = %id, task = %task_id, "planned fix subtask");
        new_ids.push(id);
    }

    Ok((updated, new_ids))
}

fn first_task_id(backlog: &Backlog) -> Option<ItemId> {
    backlog
        .backlog
        .iter()
        .flat_map(|p| &p.milestones)
        .flat_map(|m| &m.tasks)
        .map(|t| t.id.clone())
        .next()
}

fn fix_contract(bug: &BugReport) -> String {
    let single_line = |text: &str| {
        let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if joined.is_empty() {
            "unspecified".to_string()
        } else {
            joined
        }
    };
    format!(
        "CONTRACT DEFINITION:\n\
         1. RESEARCH NOTE: QA review finding: {}\n\
         2. INPUT: The implemented scope as committed.\n\
         3. LOGIC: {}\n\
         4. OUTPUT: The defect is resolved and all validation gates pass.",
        single_line(&bug.title),
        single_line(&bug.detail)
    )
}

/// Run each fix subtask as its own scoped sub-run.
pub async fn run_fix_cycle(
    manager: Arc<SessionManager>,
    runtime: Arc<PrpRuntime>,
    config: &RunnerConfig,
    fix_ids: &[ItemId],
    cancel: &CancelToken,
) -> Result<Vec<RunSummary>, OrchestratorError> {
    let mut summaries = Vec::new();
    for id in fix_ids {
        if cancel.is_cancelled() {
            break;
        }
        let mut orchestrator = Orchestrator::new(
            Arc::clone(&manager),
            Arc::clone(&runtime),
            Some(id.clone()),
            config.clone(),
        )?
        .with_cancel_token(cancel.clone());
        summaries.push(orchestrator.run().await?);
    }
    Ok(summaries)
}
