//! The orchestrator loop.
//!
//! The execution queue is the DFS pre-order flattening of the scoped backlog
//! subtree. Phases, milestones, and tasks only mark lifecycle (their
//! descendants are already enqueued behind them); subtasks run the full PRP
//! pipeline. Before a subtask dispatches, every declared dependency is
//! checked: a failed dependency blocks the subtask, a still-pending one is
//! waited out in parallel mode. The loop stops between items on
//! cancellation, flushing pending status updates first.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::errors::{OrchestratorError, PrpError};
use crate::model::{ItemId, ItemLevel, ItemStatus, Subtask};
use crate::orchestrator::cancel::CancelToken;
use crate::prp::{PrpRuntime, SubtaskOutcome};
use crate::scope::{self, QueueItem};
use crate::session::SessionManager;

/// End-of-run summary. Counters cover subtasks; `total_items` covers the
/// whole queue including lifecycle items.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total_items: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub duration_ms: u64,
    pub session_path: PathBuf,
    pub cancelled: bool,
    pub failures: Vec<FailureRecord>,
}

impl RunSummary {
    pub fn all_complete(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && !self.cancelled
    }
}

/// A surfaced subtask failure.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub subtask: ItemId,
    pub reason: String,
}

enum WorkerResult {
    Completed(Box<SubtaskOutcome>),
    Failed(String),
    Cancelled,
}

pub struct Orchestrator {
    manager: Arc<SessionManager>,
    runtime: Arc<PrpRuntime>,
    config: RunnerConfig,
    cancel: CancelToken,
    queue: VecDeque<QueueItem>,
    total_items: usize,
    completed: usize,
    failed: usize,
    blocked: usize,
    failures: Vec<FailureRecord>,
    workers: JoinSet<(ItemId, WorkerResult)>,
}

impl Orchestrator {
    /// Build the execution queue for `scope` (default: the first phase).
    pub fn new(
        manager: Arc<SessionManager>,
        runtime: Arc<PrpRuntime>,
        scope_id: Option<ItemId>,
        config: RunnerConfig,
    ) -> Result<Self, OrchestratorError> {
        let backlog = manager.backlog()?;
        let scope_id = match scope_id {
            Some(id) => id,
            None => scope::default_scope(&backlog)?,
        };
        let queue: VecDeque<QueueItem> = scope::resolve(&backlog, &scope_id)?.into();
        let total_items = queue.len();
        info!(scope = %scope_id, total_items, "execution queue built");

        Ok(Self {
            manager,
            runtime,
            config,
            cancel: CancelToken::new(),
            queue,
            total_items,
            completed: 0,
            failed: 0,
            blocked: 0,
            failures: Vec::new(),
            workers: JoinSet::new(),
        })
    }

    /// The cancellation token propagated into every blocking call site.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Share an externally owned cancellation token (e.g. the process-wide
    /// Ctrl-C token) instead of the orchestrator's own.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Switch a live orchestrator to a new scope: rebuilds the queue from the
    /// refreshed backlog while preserving session state. Any in-flight
    /// dispatch completes before the new queue takes effect.
    pub async fn set_scope(&mut self, scope_id: &ItemId) -> Result<(), OrchestratorError> {
        self.drain_workers().await;
        let backlog = self.manager.backlog()?;
        self.queue = scope::resolve(&backlog, scope_id)?.into();
        self.total_items = self.queue.len();
        self.completed = 0;
        self.failed = 0;
        self.blocked = 0;
        self.failures.clear();
        info!(scope = %scope_id, total_items = self.total_items, "scope switched");
        Ok(())
    }

    /// Process the head of the queue. Returns `false` when the queue is
    /// empty or cancellation was requested, which is the termination
    /// condition.
    pub async fn process_next_item(&mut self) -> Result<bool, OrchestratorError> {
        if self.cancel.is_cancelled() {
            self.drain_workers().await;
            let _ = self.manager.flush_updates().await;
            return Ok(false);
        }
        let Some(item) = self.queue.pop_front() else {
            self.drain_workers().await;
            return Ok(false);
        };

        match item.level {
            ItemLevel::Phase | ItemLevel::Milestone | ItemLevel::Task => {
                self.mark_lifecycle(&item.id).await?;
            }
            ItemLevel::Subtask => {
                self.dispatch_subtask(&item.id).await?;
                if self.config.fail_fast && (self.failed > 0 || self.blocked > 0) {
                    warn!("fail-fast: draining queue after surfaced failure");
                    self.drain_workers().await;
                    self.queue.clear();
                }
            }
        }
        Ok(true)
    }

    /// Drive the queue to completion and report.
    pub async fn run(&mut self) -> Result<RunSummary, OrchestratorError> {
        let start = Instant::now();
        while self.process_next_item().await? {}
        self.drain_workers().await;
        let _ = self.manager.flush_updates().await;

        let summary = RunSummary {
            total_items: self.total_items,
            completed: self.completed,
            failed: self.failed,
            blocked: self.blocked,
            duration_ms: start.elapsed().as_millis() as u64,
            session_path: self.manager.session().path.clone(),
            cancelled: self.cancel.is_cancelled(),
            failures: self.failures.clone(),
        };
        info!(
            completed = summary.completed,
            failed = summary.failed,
            blocked = summary.blocked,
            duration_ms = summary.duration_ms,
            "run finished"
        );
        Ok(summary)
    }

    /// Phases, milestones, and tasks carry no work of their own; their role
    /// is to mark lifecycle for observers. Descendants are already enqueued
    /// in DFS order behind them.
    async fn mark_lifecycle(&mut self, id: &ItemId) -> Result<(), OrchestratorError> {
        self.manager
            .update_item_status(id, ItemStatus::Implementing)?;
        self.manager.flush_updates().await?;
        Ok(())
    }

    async fn dispatch_subtask(&mut self, id: &ItemId) -> Result<(), OrchestratorError> {
        let backlog = self.manager.backlog()?;
        let Some(subtask) = backlog.subtask(id).cloned() else {
            return Err(OrchestratorError::InvalidType {
                id: id.to_string(),
                type_tag: "missing subtask".to_string(),
            });
        };

        // Already complete (carried forward from a parent session, or a
        // re-run over the same PRD): nothing to do, no agent call.
        if subtask.status == ItemStatus::Complete {
            info!(subtask = %id, "already complete, skipping");
            self.completed += 1;
            return Ok(());
        }

        // Dependency gating.
        match self.await_dependencies(&subtask).await? {
            DependencyVerdict::Ready => {}
            DependencyVerdict::Blocked(dep) => {
                warn!(subtask = %id, dependency = %dep, "dependency failed, blocking subtask");
                self.manager.update_item_status(id, ItemStatus::Blocked)?;
                self.manager.flush_updates().await?;
                self.blocked += 1;
                self.failures.push(FailureRecord {
                    subtask: id.clone(),
                    reason: format!("blocked on failed dependency {dep}"),
                });
                return Ok(());
            }
            DependencyVerdict::Cancelled => return Ok(()),
        }

        if self.config.parallelism <= 1 {
            let result = run_subtask(
                Arc::clone(&self.manager),
                Arc::clone(&self.runtime),
                subtask,
                self.cancel.clone(),
            )
            .await;
            self.absorb(id.clone(), result);
            return Ok(());
        }

        // Parallel mode: bound in-flight subtasks, then hand off.
        while self.workers.len() >= self.config.parallelism {
            self.join_one().await;
        }
        let manager = Arc::clone(&self.manager);
        let runtime = Arc::clone(&self.runtime);
        let cancel = self.cancel.clone();
        let worker_id = id.clone();
        self.workers.spawn(async move {
            let result = run_subtask(manager, runtime, subtask, cancel).await;
            (worker_id, result)
        });
        Ok(())
    }

    /// Check every declared dependency of `subtask`, waiting out pending
    /// ones while workers are in flight.
    async fn await_dependencies(
        &mut self,
        subtask: &Subtask,
    ) -> Result<DependencyVerdict, OrchestratorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(DependencyVerdict::Cancelled);
            }
            let backlog = self.manager.backlog()?;
            let mut pending: Option<ItemId> = None;
            for dep in &subtask.dependencies {
                match backlog.status_of(dep) {
                    Some(ItemStatus::Complete) => {}
                    Some(ItemStatus::Failed) | Some(ItemStatus::Blocked) => {
                        return Ok(DependencyVerdict::Blocked(dep.clone()));
                    }
                    Some(_) => pending = Some(dep.clone()),
                    // Out-of-backlog ids are rejected at load; a miss here
                    // means the dependency fell outside the session backlog.
                    None => return Ok(DependencyVerdict::Blocked(dep.clone())),
                }
            }
            let Some(waiting_on) = pending else {
                return Ok(DependencyVerdict::Ready);
            };

            if self.workers.is_empty() {
                // Serial mode (or no in-flight work): DFS pre-order should
                // have satisfied declaration-order dependencies already, so a
                // still-pending dependency can never resolve.
                warn!(
                    subtask = %subtask.id,
                    dependency = %waiting_on,
                    "pending dependency with no in-flight work; blocking"
                );
                return Ok(DependencyVerdict::Blocked(waiting_on));
            }
            self.join_one().await;
        }
    }

    async fn join_one(&mut self) {
        if let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok((id, result)) => self.absorb(id, result),
                Err(e) => warn!(error = %e, "subtask worker panicked"),
            }
        }
    }

    async fn drain_workers(&mut self) {
        while !self.workers.is_empty() {
            self.join_one().await;
        }
    }

    fn absorb(&mut self, id: ItemId, result: WorkerResult) {
        match result {
            WorkerResult::Completed(outcome) => {
                self.completed += 1;
                info!(
                    subtask = %id,
                    cache_hit = outcome.cache_hit,
                    fix_attempts = outcome.fix_attempts,
                    commit = outcome.commit.as_deref().unwrap_or("none"),
                    "subtask complete"
                );
            }
            WorkerResult::Failed(reason) => {
                self.failed += 1;
                self.failures.push(FailureRecord {
                    subtask: id,
                    reason,
                });
            }
            WorkerResult::Cancelled => {}
        }
    }
}

enum DependencyVerdict {
    Ready,
    Blocked(ItemId),
    Cancelled,
}

/// The 3-step subtask progression: `Researching` → generate, `Implementing`
/// → execute, then `Complete` or `Failed`. One flush after the final status,
/// so a crash loses at most the in-flight subtask's updates.
async fn run_subtask(
    manager: Arc<SessionManager>,
    runtime: Arc<PrpRuntime>,
    subtask: Subtask,
    cancel: CancelToken,
) -> WorkerResult {
    let id = subtask.id.clone();

    let step = async {
        manager.update_item_status(&id, ItemStatus::Researching)?;
        let backlog = manager.backlog()?;
        let generated = runtime
            .generate(manager.session(), &backlog, &subtask, &cancel)
            .await?;

        manager.update_item_status(&id, ItemStatus::Implementing)?;
        let outcome = runtime
            .execute_and_validate(manager.session(), &subtask, &generated, &cancel)
            .await?;
        Ok::<SubtaskOutcome, PrpError>(outcome)
    };

    let result = match step.await {
        Ok(outcome) => {
            if manager
                .update_item_status(&id, ItemStatus::Complete)
                .is_err()
            {
                warn!(subtask = %id, "failed to record Complete status");
            }
            WorkerResult::Completed(Box::new(outcome))
        }
        Err(PrpError::Cancelled(_)) => {
            // Leave the status at the last completed step.
            WorkerResult::Cancelled
        }
        Err(e) => {
            if manager.update_item_status(&id, ItemStatus::Failed).is_err() {
                warn!(subtask = %id, "failed to record Failed status");
            }
            WorkerResult::Failed(e.to_string())
        }
    };

    if let Err(e) = manager.flush_updates().await {
        warn!(subtask = %id, error = %e, "flush after subtask failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::stub::ScriptedAgent;
    use crate::agent::{Agent, AgentSet};
    use crate::model::fixtures::{chained_backlog, linear_backlog};
    use crate::model::{Backlog, Milestone, Phase, Task};
    use crate::prp::blueprint::test_support::blueprint_json;
    use serde_json::json;
    use tempfile::tempdir;

    struct Fixture {
        manager: Arc<SessionManager>,
        project_dir: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture(backlog: Backlog) -> Fixture {
        let dir = tempdir().unwrap();
        let prd = dir.path().join("PRD.md");
        std::fs::write(&prd, "# PRD").unwrap();
        let manager = SessionManager::initialize(&prd, &dir.path().join("plans")).unwrap();
        manager.set_backlog(backlog).unwrap();
        let project_dir = dir.path().join("project");
        std::fs::create_dir_all(&project_dir).unwrap();
        Fixture {
            manager: Arc::new(manager),
            project_dir,
            _dir: dir,
        }
    }

    fn quick_config() -> RunnerConfig {
        RunnerConfig {
            retry_base_delay_ms: 1,
            commit_enabled: false,
            ..RunnerConfig::default()
        }
    }

    fn agents(researcher: Arc<dyn Agent>, coder: Arc<dyn Agent>) -> AgentSet {
        AgentSet {
            architect: researcher.clone(),
            researcher,
            coder,
            qa: Arc::new(ScriptedAgent::always(json!({}))),
        }
    }

    fn orchestrator(
        fixture: &Fixture,
        agent_set: &AgentSet,
        scope: Option<&str>,
        config: RunnerConfig,
    ) -> Orchestrator {
        let runtime = Arc::new(PrpRuntime::new(agent_set, &fixture.project_dir, config.clone()));
        Orchestrator::new(
            Arc::clone(&fixture.manager),
            runtime,
            scope.map(|s| ItemId::parse(s).unwrap()),
            config,
        )
        .unwrap()
    }

    fn happy_agents() -> AgentSet {
        agents(
            Arc::new(ScriptedAgent::always(blueprint_json())),
            Arc::new(ScriptedAgent::always(
                json!({"result": "success", "message": "done"}),
            )),
        )
    }

    #[tokio::test]
    async fn test_empty_queue_returns_false_immediately() {
        let mut backlog = linear_backlog(1);
        backlog.backlog.push(Phase::new(
            ItemId::parse("P2").unwrap(),
            "Empty phase",
            "nothing in here",
        ));
        let fixture = fixture(backlog);
        let agent_set = happy_agents();
        let mut orch = orchestrator(&fixture, &agent_set, Some("P2"), quick_config());

        // P2 itself is the only queue entry.
        assert!(orch.process_next_item().await.unwrap());
        assert!(!orch.process_next_item().await.unwrap());
    }

    #[tokio::test]
    async fn test_serial_run_completes_all_subtasks() {
        let fixture = fixture(linear_backlog(2));
        let agent_set = happy_agents();
        let mut orch = orchestrator(&fixture, &agent_set, None, quick_config());

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.total_items, 5);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.blocked, 0);
        assert!(summary.all_complete());

        let reloaded = fixture.manager.load_backlog().unwrap();
        for raw in ["P1", "P1.M1", "P1.M1.T1", "P1.M1.T1.S1", "P1.M1.T1.S2"] {
            assert_eq!(
                reloaded.status_of(&ItemId::parse(raw).unwrap()),
                Some(ItemStatus::Complete),
                "{raw}"
            );
        }
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependent_without_agent_call() {
        let fixture = fixture(chained_backlog(2));
        let researcher = Arc::new(ScriptedAgent::always(blueprint_json()));
        // S1's coder always errors; S2 depends on S1 and must never prompt.
        let coder = Arc::new(ScriptedAgent::always(
            json!({"result": "error", "message": "broken"}),
        ));
        let agent_set = agents(researcher, coder.clone());
        let mut orch = orchestrator(&fixture, &agent_set, None, quick_config());

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.blocked, 1);
        assert!(!summary.all_complete());

        let reloaded = fixture.manager.load_backlog().unwrap();
        assert_eq!(
            reloaded.status_of(&ItemId::parse("P1.M1.T1.S1").unwrap()),
            Some(ItemStatus::Failed)
        );
        assert_eq!(
            reloaded.status_of(&ItemId::parse("P1.M1.T1.S2").unwrap()),
            Some(ItemStatus::Blocked)
        );
        // S1: 3 coder attempts. S2: zero.
        assert_eq!(coder.call_count(), 3);
    }

    #[tokio::test]
    async fn test_subtask_scope_processes_exactly_one_item() {
        let fixture = fixture(linear_backlog(3));
        let agent_set = happy_agents();
        let mut orch = orchestrator(&fixture, &agent_set, Some("P1.M1.T1.S2"), quick_config());

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.total_items, 1);
        assert_eq!(summary.completed, 1);

        let reloaded = fixture.manager.load_backlog().unwrap();
        assert_eq!(
            reloaded.status_of(&ItemId::parse("P1.M1.T1.S1").unwrap()),
            Some(ItemStatus::Planned)
        );
        assert_eq!(
            reloaded.status_of(&ItemId::parse("P1.M1.T1.S2").unwrap()),
            Some(ItemStatus::Complete)
        );
    }

    #[tokio::test]
    async fn test_best_effort_continues_past_failure() {
        // S1 fails, S2 is independent and still runs.
        let fixture = fixture(linear_backlog(2));
        let researcher = Arc::new(ScriptedAgent::always(blueprint_json()));
        let coder = Arc::new(ScriptedAgent::script_then(
            vec![
                Ok(json!({"result": "error", "message": "broken"})),
                Ok(json!({"result": "error", "message": "broken"})),
                Ok(json!({"result": "error", "message": "broken"})),
            ],
            json!({"result": "success", "message": "done"}),
        ));
        let agent_set = agents(researcher, coder);
        let mut orch = orchestrator(&fixture, &agent_set, None, quick_config());

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].subtask.to_string(), "P1.M1.T1.S1");
    }

    #[tokio::test]
    async fn test_fail_fast_stops_dispatching() {
        let fixture = fixture(linear_backlog(3));
        let researcher = Arc::new(ScriptedAgent::always(blueprint_json()));
        let coder = Arc::new(ScriptedAgent::always(
            json!({"result": "error", "message": "broken"}),
        ));
        let agent_set = agents(researcher, coder);
        let config = RunnerConfig {
            fail_fast: true,
            ..quick_config()
        };
        let mut orch = orchestrator(&fixture, &agent_set, None, config);

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.failed, 1);
        // S2 and S3 never dispatched.
        let reloaded = fixture.manager.load_backlog().unwrap();
        assert_eq!(
            reloaded.status_of(&ItemId::parse("P1.M1.T1.S2").unwrap()),
            Some(ItemStatus::Planned)
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_items() {
        let fixture = fixture(linear_backlog(3));
        let agent_set = happy_agents();
        let mut orch = orchestrator(&fixture, &agent_set, None, quick_config());
        let cancel = orch.cancel_token();

        // Lifecycle markers first (P1, M1, T1), then cancel before subtasks.
        assert!(orch.process_next_item().await.unwrap());
        assert!(orch.process_next_item().await.unwrap());
        assert!(orch.process_next_item().await.unwrap());
        cancel.cancel();
        assert!(!orch.process_next_item().await.unwrap());

        let summary = orch.run().await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.completed, 0);
        let reloaded = fixture.manager.load_backlog().unwrap();
        assert_eq!(
            reloaded.status_of(&ItemId::parse("P1.M1.T1.S1").unwrap()),
            Some(ItemStatus::Planned)
        );
    }

    #[tokio::test]
    async fn test_scope_switch_rebuilds_queue() {
        let mut backlog = linear_backlog(1);
        let mut m2 = Milestone::new(ItemId::parse("P1.M2").unwrap(), "Second milestone", "more");
        let mut t1 = Task::new(ItemId::parse("P1.M2.T1").unwrap(), "Another task", "more");
        t1.subtasks.push(crate::model::Subtask::new(
            ItemId::parse("P1.M2.T1.S1").unwrap(),
            "Other subtask",
            2,
            &crate::model::fixtures::contract_block(),
        ));
        m2.tasks.push(t1);
        backlog.backlog[0].milestones.push(m2);

        let fixture = fixture(backlog);
        let agent_set = happy_agents();
        let mut orch = orchestrator(&fixture, &agent_set, Some("P1.M1"), quick_config());
        orch.set_scope(&ItemId::parse("P1.M2").unwrap()).await.unwrap();

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.completed, 1);
        let reloaded = fixture.manager.load_backlog().unwrap();
        assert_eq!(
            reloaded.status_of(&ItemId::parse("P1.M2.T1.S1").unwrap()),
            Some(ItemStatus::Complete)
        );
        assert_eq!(
            reloaded.status_of(&ItemId::parse("P1.M1.T1.S1").unwrap()),
            Some(ItemStatus::Planned)
        );
    }

    #[tokio::test]
    async fn test_parallel_mode_respects_dependencies() {
        let fixture = fixture(chained_backlog(4));
        let agent_set = happy_agents();
        let config = RunnerConfig {
            parallelism: 3,
            ..quick_config()
        };
        let mut orch = orchestrator(&fixture, &agent_set, None, config);

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.completed, 4);
        assert!(summary.all_complete());
    }

    #[tokio::test]
    async fn test_parallel_mode_independent_subtasks() {
        let fixture = fixture(linear_backlog(6));
        let agent_set = happy_agents();
        let config = RunnerConfig {
            parallelism: 4,
            ..quick_config()
        };
        let mut orch = orchestrator(&fixture, &agent_set, None, config);

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.completed, 6);
    }

    #[tokio::test]
    async fn test_unknown_scope_is_error() {
        let fixture = fixture(linear_backlog(1));
        let agent_set = happy_agents();
        let runtime = Arc::new(PrpRuntime::new(
            &agent_set,
            &fixture.project_dir,
            quick_config(),
        ));
        let result = Orchestrator::new(
            Arc::clone(&fixture.manager),
            runtime,
            Some(ItemId::parse("P7").unwrap()),
            quick_config(),
        );
        assert!(matches!(result, Err(OrchestratorError::ScopeNotFound(_))));
    }
}
