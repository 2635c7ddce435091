//! Content-addressed session directories.
//!
//! A session is a directory `<seq>_<hash12>` under the plan root, where
//! `seq` is a zero-padded monotonic counter and `hash12` is the first 12 hex
//! chars of `SHA-256(PRD.md)`. The directory owns everything the run
//! persists:
//!
//! ```text
//! prd_snapshot.md
//! tasks.json
//! parent_session.txt          (delta sessions only)
//! PRP/<subtask-id>.md
//! PRP/.cache/<subtask-id>.json
//! artifacts/<subtask-id>/checkpoints.json
//! ```

pub mod atomic;
pub mod delta;
pub mod manager;

pub use manager::{BatchStats, SessionManager};

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::errors::SessionError;
use crate::model::ItemId;

/// Full SHA-256 of PRD bytes as lowercase hex.
pub fn hash_prd(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// First 12 hex chars of a full PRD hash.
pub fn short_hash(full: &str) -> &str {
    &full[..12]
}

/// A loaded or created session directory handle.
#[derive(Debug, Clone)]
pub struct Session {
    /// Directory name, e.g. `001_1a2b3c4d5e6f`
    pub id: String,
    /// Monotonic sequence number within the plan root
    pub sequence: u32,
    /// Full PRD hash (64 hex chars)
    pub prd_hash: String,
    /// Absolute session directory path
    pub path: PathBuf,
    /// Parent session id, for delta sessions
    pub parent: Option<String>,
}

impl Session {
    pub fn tasks_path(&self) -> PathBuf {
        self.path.join("tasks.json")
    }

    pub fn prd_snapshot_path(&self) -> PathBuf {
        self.path.join("prd_snapshot.md")
    }

    pub fn parent_link_path(&self) -> PathBuf {
        self.path.join("parent_session.txt")
    }

    pub fn prp_dir(&self) -> PathBuf {
        self.path.join("PRP")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.prp_dir().join(".cache")
    }

    pub fn blueprint_path(&self, id: &ItemId) -> PathBuf {
        self.prp_dir().join(format!("{id}.md"))
    }

    pub fn cache_entry_path(&self, id: &ItemId) -> PathBuf {
        self.cache_dir().join(format!("{id}.json"))
    }

    pub fn artifacts_dir(&self, id: &ItemId) -> PathBuf {
        self.path.join("artifacts").join(id.to_string())
    }

    pub fn checkpoints_path(&self, id: &ItemId) -> PathBuf {
        self.artifacts_dir(id).join("checkpoints.json")
    }

    /// Whether `prd_bytes` differs from the PRD this session was built from.
    pub fn prd_changed(&self, prd_bytes: &[u8]) -> bool {
        hash_prd(prd_bytes) != self.prd_hash
    }
}

/// Summary row for session listings.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub sequence: u32,
    pub hash12: String,
    pub path: PathBuf,
    pub parent: Option<String>,
}

/// Split a directory name into `(sequence, hash12)` if it matches the
/// session naming scheme.
fn parse_session_dir_name(name: &str) -> Option<(u32, &str)> {
    let (seq, hash) = name.split_once('_')?;
    if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if hash.len() != 12 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((seq.parse().ok()?, hash))
}

/// Enumerate sessions under the plan root, sequence order.
pub fn list_sessions(plan_root: &Path) -> Result<Vec<SessionInfo>, SessionError> {
    let entries = std::fs::read_dir(plan_root).map_err(|source| SessionError::PlanRoot {
        path: plan_root.to_path_buf(),
        source,
    })?;

    let mut sessions = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((sequence, hash12)) = parse_session_dir_name(&name) else {
            continue;
        };
        let parent = read_parent_link(&entry.path());
        sessions.push(SessionInfo {
            id: name.clone(),
            sequence,
            hash12: hash12.to_string(),
            path: entry.path(),
            parent,
        });
    }
    sessions.sort_by_key(|s| s.sequence);
    Ok(sessions)
}

/// Find an existing session whose id ends with `_<hash12>`.
pub fn find_by_hash(plan_root: &Path, hash12: &str) -> Result<Option<SessionInfo>, SessionError> {
    Ok(list_sessions(plan_root)?
        .into_iter()
        .find(|s| s.hash12 == hash12))
}

/// Next free sequence number in the plan root.
pub fn next_sequence(plan_root: &Path) -> Result<u32, SessionError> {
    Ok(list_sessions(plan_root)?
        .last()
        .map(|s| s.sequence + 1)
        .unwrap_or(1))
}

/// Allocate the next session directory for `prd_bytes`, write the PRD
/// snapshot and (for delta sessions) the parent link, and create the PRP and
/// artifacts subtrees.
pub(crate) fn create_session_dir(
    plan_root: &Path,
    prd_bytes: &[u8],
    parent: Option<&str>,
) -> Result<Session, SessionError> {
    let full_hash = hash_prd(prd_bytes);
    let sequence = next_sequence(plan_root)?;
    let id = format!("{:03}_{}", sequence, short_hash(&full_hash));
    let path = plan_root.join(&id);

    for dir in [path.clone(), path.join("PRP"), path.join("PRP/.cache"), path.join("artifacts")] {
        std::fs::create_dir_all(&dir).map_err(|source| SessionError::PlanRoot {
            path: dir.clone(),
            source,
        })?;
    }

    let session = Session {
        id,
        sequence,
        prd_hash: full_hash,
        path,
        parent: parent.map(str::to_string),
    };
    atomic::write_atomic(&session.prd_snapshot_path(), prd_bytes)?;
    if let Some(parent_id) = parent {
        atomic::write_atomic(&session.parent_link_path(), format!("{parent_id}\n").as_bytes())?;
    }
    Ok(session)
}

fn read_parent_link(session_path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(session_path.join("parent_session.txt")).ok()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
