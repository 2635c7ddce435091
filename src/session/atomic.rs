//! Atomic file persistence.
//!
//! All session state lands on disk through a write-then-rename protocol:
//! write the payload to a hidden temp file in the target's directory, then
//! rename over the target. Rename is atomic on POSIX when source and target
//! share a filesystem, which holds here because the temp file is created next
//! to the target. On non-POSIX filesystems without atomic rename the session
//! manager refuses to run (surfaced as a plan-root error at initialization).
//!
//! A failed write never leaves the target in a partial state: the old content
//! stays untouched and the temp file is unlinked best-effort.

use std::path::{Path, PathBuf};

use crate::errors::SessionError;

/// Write `bytes` to `target` atomically.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), SessionError> {
    let tmp = temp_path(target);
    let fail = |source: std::io::Error| SessionError::AtomicWrite {
        path: target.to_path_buf(),
        source,
    };

    if let Err(source) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(fail(source));
    }
    if let Err(source) = std::fs::rename(&tmp, target) {
        let _ = std::fs::remove_file(&tmp);
        return Err(fail(source));
    }
    Ok(())
}

/// Hidden sibling temp file: `.{base}.{16 hex}.tmp`.
fn temp_path(target: &Path) -> PathBuf {
    let base = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let nonce: u64 = rand::random();
    let name = format!(".{base}.{nonce:016x}.tmp");
    match target.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}
