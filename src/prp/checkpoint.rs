//! Per-subtask checkpoints for crash recovery.
//!
//! A checkpoint is written at each stage boundary of the PRP pipeline into
//! `artifacts/<subtask-id>/checkpoints.json`. Writes are atomic, and a
//! retention policy keeps the most recent N checkpoints, pruning oldest
//! first on save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::SessionError;
use crate::session::atomic::write_atomic;

const CHECKPOINT_VERSION: u32 = 1;

/// Pipeline stage a checkpoint was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "pre-execution")]
    PreExecution,
    #[serde(rename = "coder-response")]
    CoderResponse,
    #[serde(rename = "validation-gate-1")]
    ValidationGate1,
    #[serde(rename = "validation-gate-2")]
    ValidationGate2,
    #[serde(rename = "validation-gate-3")]
    ValidationGate3,
    #[serde(rename = "validation-gate-4")]
    ValidationGate4,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl Stage {
    pub fn validation_gate(level: u8) -> Option<Stage> {
        match level {
            1 => Some(Self::ValidationGate1),
            2 => Some(Self::ValidationGate2),
            3 => Some(Self::ValidationGate3),
            4 => Some(Self::ValidationGate4),
            _ => None,
        }
    }

    /// Position in the declared stage progression (`cancelled` fits anywhere).
    pub fn order(&self) -> u8 {
        match self {
            Self::PreExecution => 0,
            Self::CoderResponse => 1,
            Self::ValidationGate1 => 2,
            Self::ValidationGate2 => 3,
            Self::ValidationGate3 => 4,
            Self::ValidationGate4 => 5,
            Self::Cancelled => u8::MAX,
        }
    }
}

/// Result of one validation gate run, as persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateRecord {
    pub gate: u8,
    pub passed: bool,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
}

/// Snapshot of the pipeline state at a stage boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    pub prp_path: PathBuf,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coder_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coder_result: Option<String>,
    #[serde(default)]
    pub validation_results: Vec<GateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_attempt: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Error captured alongside a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

/// One persisted checkpoint record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: String,
    pub label: String,
    pub state: CheckpointState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CheckpointError>,
    pub created_at: DateTime<Utc>,
}

/// The `checkpoints.json` file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointFile {
    pub version: u32,
    pub checkpoints: Vec<Checkpoint>,
    pub last_modified: DateTime<Utc>,
}

/// Writer for one subtask's checkpoint file.
pub struct CheckpointManager {
    path: PathBuf,
    subtask_id: String,
    retention: usize,
    file: CheckpointFile,
}

impl CheckpointManager {
    /// Open (or start) the checkpoint file for `subtask_id` at `path`.
    pub fn open(path: &Path, subtask_id: &str, retention: usize) -> Self {
        let file = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or(CheckpointFile {
                version: CHECKPOINT_VERSION,
                checkpoints: Vec::new(),
                last_modified: Utc::now(),
            });
        Self {
            path: path.to_path_buf(),
            subtask_id: subtask_id.to_string(),
            retention: retention.max(1),
            file,
        }
    }

    /// Record a checkpoint and persist the pruned file atomically.
    pub fn record(
        &mut self,
        label: &str,
        state: CheckpointState,
        error: Option<CheckpointError>,
    ) -> Result<(), SessionError> {
        self.file.checkpoints.push(Checkpoint {
            id: Uuid::new_v4(),
            task_id: self.subtask_id.clone(),
            label: label.to_string(),
            state,
            error,
            created_at: Utc::now(),
        });
        let excess = self.file.checkpoints.len().saturating_sub(self.retention);
        if excess > 0 {
            self.file.checkpoints.drain(..excess);
        }
        self.file.last_modified = Utc::now();
        self.save()
    }

    fn save(&self) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SessionError::SessionFile {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(&self.file)
            .map_err(|e| SessionError::Schema(crate::errors::SchemaError::Json(e)))?;
        write_atomic(&self.path, json.as_bytes())
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.file.checkpoints
    }
}

/// Convenience constructor for a stage-boundary state snapshot.
pub fn state_at(prp_path: &Path, stage: Stage) -> CheckpointState {
    CheckpointState {
        prp_path: prp_path.to_path_buf(),
        stage,
        coder_response: None,
        coder_result: None,
        validation_results: Vec::new(),
        fix_attempt: None,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path, retention: usize) -> CheckpointManager {
        CheckpointManager::open(&dir.join("checkpoints.json"), "P1.M1.T1.S1", retention)
    }

    #[test]
    fn test_record_creates_file() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(dir.path(), 10);
        mgr.record(
            "pre-execution",
            state_at(Path::new("PRP/P1.M1.T1.S1.md"), Stage::PreExecution),
            None,
        )
        .unwrap();

        let content = std::fs::read_to_string(dir.path().join("checkpoints.json")).unwrap();
        let file: CheckpointFile = serde_json::from_str(&content).unwrap();
        assert_eq!(file.version, 1);
        assert_eq!(file.checkpoints.len(), 1);
        assert_eq!(file.checkpoints[0].task_id, "P1.M1.T1.S1");
        assert_eq!(file.checkpoints[0].state.stage, Stage::PreExecution);
    }

    #[test]
    fn test_stage_serialization_spellings() {
        assert_eq!(
            serde_json::to_string(&Stage::ValidationGate3).unwrap(),
            "\"validation-gate-3\""
        );
        assert_eq!(
            serde_json::to_string(&Stage::PreExecution).unwrap(),
            "\"pre-execution\""
        );
        assert_eq!(serde_json::to_string(&Stage::Cancelled).unwrap(), "\"cancelled\"");
        assert!(serde_json::from_str::<Stage>("\"validation-gate-5\"").is_err());
    }

    #[test]
    fn test_retention_prunes_oldest_first() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(dir.path(), 3);
        for i in 0..5 {
            mgr.record(
                &format!("label-{i}"),
                state_at(Path::new("p.md"), Stage::CoderResponse),
                None,
            )
            .unwrap();
        }
        let labels: Vec<&str> = mgr.checkpoints().iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["label-2", "label-3", "label-4"]);
    }

    #[test]
    fn test_reopen_appends_to_existing() {
        let dir = tempdir().unwrap();
        {
            let mut mgr = manager(dir.path(), 10);
            mgr.record("first", state_at(Path::new("p.md"), Stage::PreExecution), None)
                .unwrap();
        }
        let mut mgr = manager(dir.path(), 10);
        mgr.record("second", state_at(Path::new("p.md"), Stage::CoderResponse), None)
            .unwrap();
        assert_eq!(mgr.checkpoints().len(), 2);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(dir.path(), 10);
        for stage in [Stage::PreExecution, Stage::CoderResponse, Stage::ValidationGate1] {
            mgr.record("s", state_at(Path::new("p.md"), stage), None).unwrap();
        }
        let created: Vec<DateTime<Utc>> =
            mgr.checkpoints().iter().map(|c| c.created_at).collect();
        assert!(created.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_error_is_persisted() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(dir.path(), 10);
        mgr.record(
            "gate failed",
            state_at(Path::new("p.md"), Stage::ValidationGate2),
            Some(CheckpointError {
                message: "unit tests failed".to_string(),
                code: Some(1),
            }),
        )
        .unwrap();
        let error = mgr.checkpoints()[0].error.as_ref().unwrap();
        assert_eq!(error.code, Some(1));
    }

    #[test]
    fn test_file_uses_camel_case_keys() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(dir.path(), 10);
        mgr.record("s", state_at(Path::new("p.md"), Stage::PreExecution), None)
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("checkpoints.json")).unwrap();
        assert!(content.contains("\"lastModified\""));
        assert!(content.contains("\"taskId\""));
        assert!(content.contains("\"prpPath\""));
        assert!(content.contains("\"createdAt\""));
    }
}
