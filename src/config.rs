//! Runtime configuration for the orchestrator and PRP runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum subtasks to run in parallel (1 = strict serial DFS)
    pub parallelism: usize,
    /// Stop dispatching after the first surfaced subtask failure
    pub fail_fast: bool,
    /// Per-command timeout for validation gates, in seconds
    pub gate_timeout_secs: u64,
    /// Transport timeout for agent calls, in seconds
    pub agent_timeout_secs: u64,
    /// Coder execution attempts (exponential backoff between them)
    pub coder_attempts: u32,
    /// Base delay before the first coder retry, in milliseconds (doubles per attempt)
    pub retry_base_delay_ms: u64,
    /// Jitter applied to retry delays, as a fraction of the delay
    pub retry_jitter: f64,
    /// Fix-retry budget per subtask across all validation gates
    pub fix_attempts: u32,
    /// Blueprint generation attempts before surfacing failure
    pub blueprint_attempts: u32,
    /// Blueprint cache time-to-live, in seconds
    pub cache_ttl_secs: u64,
    /// Checkpoints retained per subtask (oldest pruned first)
    pub checkpoint_retention: usize,
    /// Grace period between SIGTERM and SIGKILL for gate subprocesses, in seconds
    pub kill_grace_secs: u64,
    /// Truncate ancestor context in researcher prompts
    pub compress_context: bool,
    /// Commit completed subtasks via git
    pub commit_enabled: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            fail_fast: false,
            gate_timeout_secs: 300,
            agent_timeout_secs: 300,
            coder_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_jitter: 0.2,
            fix_attempts: 3,
            blueprint_attempts: 3,
            cache_ttl_secs: 24 * 60 * 60,
            checkpoint_retention: 10,
            kill_grace_secs: 5,
            compress_context: true,
            commit_enabled: true,
        }
    }
}

impl RunnerConfig {
    /// Set the parallelism bound.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Enable or disable fail-fast mode.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set the per-gate command timeout.
    pub fn with_gate_timeout(mut self, secs: u64) -> Self {
        self.gate_timeout_secs = secs;
        self
    }

    /// Set the agent transport timeout.
    pub fn with_agent_timeout(mut self, secs: u64) -> Self {
        self.agent_timeout_secs = secs;
        self
    }

    /// Set the fix-retry budget.
    pub fn with_fix_attempts(mut self, attempts: u32) -> Self {
        self.fix_attempts = attempts;
        self
    }

    /// Set the blueprint cache TTL.
    pub fn with_cache_ttl(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    /// Set the checkpoint retention count.
    pub fn with_checkpoint_retention(mut self, count: usize) -> Self {
        self.checkpoint_retention = count;
        self
    }

    /// Enable or disable git commits after completed subtasks.
    pub fn with_commits(mut self, enabled: bool) -> Self {
        self.commit_enabled = enabled;
        self
    }

    /// Gate timeout as a `Duration`.
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }

    /// Agent timeout as a `Duration`.
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// Backoff delay for a zero-based retry attempt, before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms << attempt.min(16))
    }
}
