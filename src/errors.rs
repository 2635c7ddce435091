//! Typed error hierarchy for the anvil orchestrator.
//!
//! One enum per subsystem:
//! - `SchemaError` — backlog schema violations (id grammar, ranges, graph shape)
//! - `SessionError` — session store and persistence failures
//! - `AgentError` — agent transport and payload failures
//! - `PrpError` — per-subtask blueprint/execution/validation failures
//! - `OrchestratorError` — queue construction and dispatch failures
//!
//! Input and programmer errors terminate the run (exit 2); persistence errors
//! are retryable via a subsequent flush; execution errors are absorbed by the
//! PRP retry loop and become `Failed` status on exhaustion.

use std::path::PathBuf;
use thiserror::Error;

/// Violations detected by the backlog schema validator.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Invalid item id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Duplicate item id: {0}")]
    DuplicateId(String),

    #[error("Item {id}: title length {len} outside 1..=200")]
    TitleLength { id: String, len: usize },

    #[error("Subtask {id}: story_points {points} outside 1..=21")]
    StoryPointsRange { id: String, points: u64 },

    #[error("Subtask {id}: malformed context_scope: {reason}")]
    MalformedContract { id: String, reason: String },

    #[error(
        "Subtask {id}: dependency '{dependency}' does not resolve to a subtask in this backlog"
    )]
    UnknownDependency { id: String, dependency: String },

    #[error("Subtask {id} depends on itself")]
    SelfDependency { id: String },

    #[error("Dependency cycle detected involving subtasks: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("Item {id}: declared under parent {parent}, but its id prefix disagrees")]
    ParentMismatch { id: String, parent: String },

    #[error("Failed to parse backlog JSON: {0}")]
    Json(#[source] serde_json::Error),
}

/// Errors from the session manager and atomic store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to read PRD at {path}: {source}")]
    PrdRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("PRD at {path} is not valid UTF-8")]
    PrdEncoding { path: PathBuf },

    #[error("Failed to create or access plan root {path}: {source}")]
    PlanRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session {id} exists but failed to load: {source}")]
    SessionLoad {
        id: String,
        #[source]
        source: Box<SessionError>,
    },

    #[error("Atomic write to {path} failed: {source}")]
    AtomicWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session file error at {path}: {source}")]
    SessionFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backlog schema validation failed: {0}")]
    Schema(#[from] SchemaError),

    #[error("Delta parent session '{0}' does not exist")]
    MissingParent(String),

    #[error("No backlog loaded for session {0}")]
    NoBacklog(String),

    #[error("Unknown item id '{0}' in status update")]
    UnknownItem(String),
}

/// Errors from the agent seam. Transport and payload failures are kept
/// distinct so the retry policy can tell them apart.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent reported error: {0}")]
    Payload(String),

    #[error("Agent reported issue requiring inspection: {0}")]
    Issue(String),

    #[error("Agent transport failure: {0}")]
    Transport(String),

    #[error("Agent call timed out after {0}s")]
    Timeout(u64),

    #[error("Agent response does not conform to the declared schema: {0}")]
    SchemaMismatch(String),
}

impl AgentError {
    /// Transport failures and plain error payloads are retryable; an `issue`
    /// payload and a schema mismatch need a different prompt, not a replay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Payload(_) | Self::Transport(_) | Self::Timeout(_)
        )
    }
}

/// Errors from the per-subtask PRP runtime.
#[derive(Debug, Error)]
pub enum PrpError {
    #[error("Blueprint generation failed for {subtask} after {attempts} attempts: {reason}")]
    BlueprintGeneration {
        subtask: String,
        attempts: u32,
        reason: String,
    },

    #[error("Coder execution failed for {subtask}: {reason}")]
    CoderExecution { subtask: String, reason: String },

    #[error("Validation gate {gate} failed for {subtask} (exit {exit_code}): {stderr}")]
    GateFailure {
        subtask: String,
        gate: u8,
        exit_code: i32,
        stderr: String,
    },

    #[error("Fix-retry budget exhausted for {subtask} after {attempts} attempts")]
    FixBudgetExhausted { subtask: String, attempts: u32 },

    #[error("Subtask {0} cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the orchestrator (queue construction and dispatch).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Scope '{0}' does not resolve to any backlog item")]
    ScopeNotFound(String),

    #[error("Invalid scope string '{0}' (expected P<n>[.M<n>[.T<n>[.S<n>]]])")]
    InvalidScope(String),

    #[error("Queue item {id} has unknown type tag '{type_tag}'")]
    InvalidType { id: String, type_tag: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
