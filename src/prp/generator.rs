//! Blueprint generation via the researcher agent.
//!
//! The prompt carries the subtask's contract plus ancestor context re-found
//! from id prefixes (no back-pointers in the backlog). Ancestor context is
//! limited to two levels of parents, each truncated to 100 chars when
//! compression is active. Responses are validated against the blueprint
//! schema; schema failures retry, persistent failure surfaces a
//! blueprint-generation error.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::{Agent, PromptSpec};
use crate::config::RunnerConfig;
use crate::errors::{AgentError, PrpError};
use crate::model::{Backlog, Subtask};
use crate::orchestrator::cancel::CancelToken;
use crate::prp::blueprint::Blueprint;
use crate::prp::cache::{PrpCache, cache_key};
use crate::prp::jittered;
use crate::session::Session;
use crate::session::atomic::write_atomic;
use crate::util::truncate_chars;

const ANCESTOR_CONTEXT_LEVELS: usize = 2;
const ANCESTOR_TRUNCATE_CHARS: usize = 100;

/// Result of blueprint generation for one subtask.
#[derive(Debug, Clone)]
pub struct GeneratedBlueprint {
    pub blueprint: Blueprint,
    pub path: PathBuf,
    pub cache_hit: bool,
}

/// Drives researcher prompts and the blueprint cache.
pub struct BlueprintGenerator {
    researcher: Arc<dyn Agent>,
    config: RunnerConfig,
}

impl BlueprintGenerator {
    pub fn new(researcher: Arc<dyn Agent>, config: RunnerConfig) -> Self {
        Self { researcher, config }
    }

    /// Produce the blueprint for `subtask`, from cache when fresh.
    pub async fn generate(
        &self,
        session: &Session,
        backlog: &Backlog,
        subtask: &Subtask,
        cancel: &CancelToken,
    ) -> Result<GeneratedBlueprint, PrpError> {
        let subtask_id = subtask.id.to_string();
        let key = cache_key(subtask);
        let cache = PrpCache::new(
            &session.cache_dir(),
            std::time::Duration::from_secs(self.config.cache_ttl_secs),
        );
        let path = session.blueprint_path(&subtask.id);

        if let Some(blueprint) = cache.lookup(&subtask_id, &key) {
            if !path.exists() {
                write_atomic(&path, blueprint.to_markdown(&subtask_id, &subtask.title).as_bytes())?;
            }
            return Ok(GeneratedBlueprint {
                blueprint,
                path,
                cache_hit: true,
            });
        }

        let spec = self.compose_prompt(backlog, subtask);
        let mut last_error = String::new();
        for attempt in 0..self.config.blueprint_attempts {
            if cancel.is_cancelled() {
                return Err(PrpError::Cancelled(subtask_id));
            }
            if attempt > 0 {
                tokio::time::sleep(jittered(
                    self.config.backoff_delay(attempt - 1),
                    self.config.retry_jitter,
                ))
                .await;
            }

            match self.researcher.prompt(&spec).await {
                Ok(response) => match Blueprint::from_response(response.0) {
                    Ok(blueprint) => {
                        info!(subtask = %subtask_id, attempt, "blueprint generated");
                        write_atomic(
                            &path,
                            blueprint.to_markdown(&subtask_id, &subtask.title).as_bytes(),
                        )?;
                        cache.store(&subtask_id, &key, &blueprint)?;
                        return Ok(GeneratedBlueprint {
                            blueprint,
                            path,
                            cache_hit: false,
                        });
                    }
                    Err(AgentError::SchemaMismatch(reason)) => {
                        debug!(subtask = %subtask_id, attempt, %reason, "blueprint schema mismatch");
                        last_error = reason;
                    }
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) if e.is_retryable() => {
                    debug!(subtask = %subtask_id, attempt, error = %e, "researcher call failed");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PrpError::BlueprintGeneration {
            subtask: subtask_id,
            attempts: self.config.blueprint_attempts,
            reason: last_error,
        })
    }

    fn compose_prompt(&self, backlog: &Backlog, subtask: &Subtask) -> PromptSpec {
        let mut user = String::new();
        user.push_str("## SUBTASK\n");
        user.push_str(&format!("Id: {}\n", subtask.id));
        user.push_str(&format!("Title: {}\n", subtask.title));
        user.push_str(&format!("Story points: {}\n", subtask.story_points));
        if !subtask.dependencies.is_empty() {
            let deps: Vec<String> = subtask.dependencies.iter().map(|d| d.to_string()).collect();
            user.push_str(&format!("Dependencies: {}\n", deps.join(", ")));
        }
        user.push_str("\n## CONTRACT\n");
        user.push_str(&subtask.context_scope);
        user.push('\n');

        let ancestors = subtask.id.ancestors();
        let context_chain = ancestors.iter().rev().take(ANCESTOR_CONTEXT_LEVELS);
        let mut context_lines = Vec::new();
        for ancestor_id in context_chain {
            if let Some(item) = backlog.find(ancestor_id) {
                let description = if self.config.compress_context {
                    truncate_chars(item.description(), ANCESTOR_TRUNCATE_CHARS)
                } else {
                    item.description().to_string()
                };
                context_lines.push(format!("{}: {} — {}", item.id(), item.title(), description));
            }
        }
        if !context_lines.is_empty() {
            user.push_str("\n## PARENT CONTEXT\n");
            for line in &context_lines {
                user.push_str(line);
                user.push('\n');
            }
        }

        PromptSpec::new(
            "You are a researcher agent. Produce an implementation blueprint (PRP) \
             for the given subtask: objective, context, ordered implementation steps, \
             four progressive validation gates, success criteria, and references.",
            user,
        )
        .with_schema(Blueprint::response_schema())
    }
}
