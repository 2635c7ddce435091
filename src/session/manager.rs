//! Session manager: exclusive owner of the on-disk session directory and the
//! in-memory backlog for its lifetime.
//!
//! Status updates are batched: `update_item_status` is a pure in-memory
//! operation, and `flush_updates` is the sole disk-write entry point for
//! status changes. Concurrent flushes are serialized by a per-session mutex;
//! a failed flush preserves the pending buffer so the caller may retry.

use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::errors::SessionError;
use crate::model::{Backlog, ItemId, ItemStatus, validate_backlog};
use crate::session::{self, Session, atomic::write_atomic, hash_prd, short_hash};

/// Stats emitted after a successful flush of batched updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    /// Status updates committed by this flush
    pub items_written: u32,
    /// Disk writes avoided relative to write-per-update
    pub write_ops_saved: u32,
}

#[derive(Default, Debug)]
struct BatchState {
    /// Last loaded or flushed backlog
    backlog: Option<Backlog>,
    /// Latest in-memory backlog with unflushed updates applied
    pending: Option<Backlog>,
    dirty: bool,
    update_count: u32,
}

/// Owner of a session directory and its backlog state.
#[derive(Debug)]
pub struct SessionManager {
    session: Session,
    state: StdMutex<BatchState>,
    flush_lock: AsyncMutex<()>,
    writes_in_flight: AtomicU32,
    peak_writes_in_flight: AtomicU32,
}

impl SessionManager {
    /// Load or create the session for the PRD at `prd_path` under `plan_root`.
    ///
    /// The PRD is read strictly as UTF-8 and hashed; an existing session with
    /// a matching hash suffix is loaded (and its `tasks.json`, when present,
    /// must validate), otherwise a new session directory is allocated.
    pub fn initialize(prd_path: &Path, plan_root: &Path) -> Result<Self, SessionError> {
        let bytes = std::fs::read(prd_path).map_err(|source| SessionError::PrdRead {
            path: prd_path.to_path_buf(),
            source,
        })?;
        if std::str::from_utf8(&bytes).is_err() {
            return Err(SessionError::PrdEncoding {
                path: prd_path.to_path_buf(),
            });
        }

        std::fs::create_dir_all(plan_root).map_err(|source| SessionError::PlanRoot {
            path: plan_root.to_path_buf(),
            source,
        })?;

        let full_hash = hash_prd(&bytes);
        let manager = match session::find_by_hash(plan_root, short_hash(&full_hash))? {
            Some(info) => {
                info!(session = %info.id, "loading existing session");
                let existing = Session {
                    id: info.id.clone(),
                    sequence: info.sequence,
                    prd_hash: full_hash,
                    path: info.path,
                    parent: info.parent,
                };
                let manager = Self::from_session(existing);
                if manager.session.tasks_path().exists() {
                    manager.load_backlog().map_err(|source| SessionError::SessionLoad {
                        id: info.id,
                        source: Box::new(source),
                    })?;
                }
                manager
            }
            None => {
                let created = session::create_session_dir(plan_root, &bytes, None)?;
                info!(session = %created.id, "created new session");
                Self::from_session(created)
            }
        };
        Ok(manager)
    }

    /// Wrap an already-materialized session directory.
    pub fn from_session(session: Session) -> Self {
        Self {
            session,
            state: StdMutex::new(BatchState::default()),
            flush_lock: AsyncMutex::new(()),
            writes_in_flight: AtomicU32::new(0),
            peak_writes_in_flight: AtomicU32::new(0),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Compare the hash of `prd_bytes` against this session's recorded hash.
    pub fn has_session_changed(&self, prd_bytes: &[u8]) -> bool {
        self.session.prd_changed(prd_bytes)
    }

    /// Read and validate `tasks.json`, replacing the in-memory backlog.
    pub fn load_backlog(&self) -> Result<Backlog, SessionError> {
        let path = self.session.tasks_path();
        let content = std::fs::read_to_string(&path).map_err(|source| SessionError::SessionFile {
            path: path.clone(),
            source,
        })?;
        let backlog: Backlog = serde_json::from_str(&content)
            .map_err(|e| SessionError::Schema(crate::errors::SchemaError::Json(e)))?;
        validate_backlog(&backlog)?;

        let mut state = self.state.lock().expect("batch state lock poisoned");
        state.backlog = Some(backlog.clone());
        Ok(backlog)
    }

    /// Validate and atomically write `tasks.json`.
    pub fn save_backlog(&self, backlog: &Backlog) -> Result<(), SessionError> {
        validate_backlog(backlog)?;
        // Schema validation happens before the temp file is even created, so
        // an invalid in-memory state never reaches the disk.
        let json = serde_json::to_string_pretty(backlog)
            .map_err(|e| SessionError::Schema(crate::errors::SchemaError::Json(e)))?;

        self.writes_in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.writes_in_flight.load(Ordering::SeqCst);
        self.peak_writes_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        let result = write_atomic(&self.session.tasks_path(), json.as_bytes());
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Install a freshly decomposed backlog (validates and persists).
    pub fn set_backlog(&self, backlog: Backlog) -> Result<(), SessionError> {
        self.save_backlog(&backlog)?;
        let mut state = self.state.lock().expect("batch state lock poisoned");
        state.backlog = Some(backlog);
        state.pending = None;
        state.dirty = false;
        state.update_count = 0;
        Ok(())
    }

    /// Consistent snapshot of the current backlog (pending updates included).
    pub fn backlog(&self) -> Result<Backlog, SessionError> {
        let state = self.state.lock().expect("batch state lock poisoned");
        state
            .pending
            .clone()
            .or_else(|| state.backlog.clone())
            .ok_or_else(|| SessionError::NoBacklog(self.session.id.clone()))
    }

    /// Current status of an item, seen through pending updates.
    pub fn status_of(&self, id: &ItemId) -> Result<Option<ItemStatus>, SessionError> {
        Ok(self.backlog()?.status_of(id))
    }

    /// Pure in-memory status update. Accumulates in the pending buffer and
    /// never touches disk.
    pub fn update_item_status(&self, id: &ItemId, status: ItemStatus) -> Result<(), SessionError> {
        let mut state = self.state.lock().expect("batch state lock poisoned");
        let base = state
            .pending
            .take()
            .or_else(|| state.backlog.clone())
            .ok_or_else(|| SessionError::NoBacklog(self.session.id.clone()))?;
        let updated = base.with_status(id, status)?;
        state.pending = Some(updated);
        state.dirty = true;
        state.update_count += 1;
        debug!(item = %id, status = %status, queued = state.update_count, "queued status update");
        Ok(())
    }

    /// Commit all queued updates to `tasks.json` in one atomic write.
    ///
    /// No-op when clean. Serialized per session: a second caller waits for
    /// the first to complete. On failure the dirty flag, pending buffer, and
    /// update counter keep their pre-call values so a retry commits the same
    /// content plus anything queued in the interim.
    pub async fn flush_updates(&self) -> Result<Option<BatchStats>, SessionError> {
        let _guard = self.flush_lock.lock().await;

        let (mut snapshot, count) = {
            let state = self.state.lock().expect("batch state lock poisoned");
            if !state.dirty {
                return Ok(None);
            }
            let pending = state
                .pending
                .clone()
                .expect("dirty flag implies a pending backlog");
            (pending, state.update_count)
        };

        snapshot.derive_parent_statuses();
        self.save_backlog(&snapshot)?;

        {
            let mut state = self.state.lock().expect("batch state lock poisoned");
            state.backlog = Some(snapshot);
            if state.update_count > count {
                // Updates arrived while the write was in flight; they stay
                // queued for the next flush.
                state.update_count -= count;
            } else {
                state.pending = None;
                state.dirty = false;
                state.update_count = 0;
            }
        }

        let stats = BatchStats {
            items_written: count,
            write_ops_saved: count.saturating_sub(1),
        };
        debug!(
            items_written = stats.items_written,
            write_ops_saved = stats.write_ops_saved,
            "flushed batched status updates"
        );
        Ok(Some(stats))
    }

    /// Whether unflushed updates are queued.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().expect("batch state lock poisoned").dirty
    }

    /// Number of queued status updates.
    pub fn update_count(&self) -> u32 {
        self.state
            .lock()
            .expect("batch state lock poisoned")
            .update_count
    }

    /// Peak number of concurrently in-flight `tasks.json` writes observed.
    /// Stays at 1 when flush serialization holds.
    pub fn peak_concurrent_writes(&self) -> u32 {
        self.peak_writes_in_flight.load(Ordering::SeqCst)
    }
}
