//! Blueprint cache.
//!
//! Each subtask's generated blueprint is cached under
//! `PRP/.cache/<subtask-id>.json`, keyed by a content hash over the fields
//! that define the subtask (id, title, story points, sorted dependencies,
//! contract, ancestor ids up to the phase). A lookup hits when the recorded
//! key matches the current key and the entry is younger than the TTL;
//! anything else regenerates.
//!
//! Entries are per-subtask-id, so cache writes never collide even in
//! parallel mode. Readers default missing optional fields rather than
//! reject, so entries written by older versions stay loadable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::errors::SessionError;
use crate::model::Subtask;
use crate::prp::blueprint::Blueprint;
use crate::session::atomic::write_atomic;

const CACHE_VERSION: u32 = 1;

/// On-disk cache entry. Optional compression accounting is carried when the
/// generating prompt was compressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub task_id: String,
    pub task_hash: String,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u32,
    pub prp: Blueprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
}

/// Cache key over the fields that define a subtask's blueprint input.
pub fn cache_key(subtask: &Subtask) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subtask.id.to_string().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(subtask.title.as_bytes());
    hasher.update(b"\x1f");
    hasher.update([subtask.story_points]);
    let mut deps: Vec<String> = subtask.dependencies.iter().map(|d| d.to_string()).collect();
    deps.sort();
    for dep in deps {
        hasher.update(dep.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(subtask.context_scope.as_bytes());
    for ancestor in subtask.id.ancestors() {
        hasher.update(b"\x1f");
        hasher.update(ancestor.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Per-session blueprint cache directory.
pub struct PrpCache {
    dir: PathBuf,
    ttl: Duration,
}

impl PrpCache {
    pub fn new(dir: &Path, ttl: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            ttl,
        }
    }

    fn entry_path(&self, subtask_id: &str) -> PathBuf {
        self.dir.join(format!("{subtask_id}.json"))
    }

    /// Return the cached blueprint when `key` matches and the entry is fresh,
    /// touching its access timestamp. A stale, mismatched, or unreadable
    /// entry is a miss.
    pub fn lookup(&self, subtask_id: &str, key: &str) -> Option<Blueprint> {
        let path = self.entry_path(subtask_id);
        let content = std::fs::read_to_string(&path).ok()?;
        let mut entry: CacheEntry = serde_json::from_str(&content).ok()?;

        if entry.task_hash != key {
            debug!(subtask = subtask_id, "cache key mismatch, regenerating");
            return None;
        }
        let age = Utc::now().signed_duration_since(entry.created_at);
        if age.num_seconds() < 0 || age.num_seconds() as u64 >= self.ttl.as_secs() {
            debug!(subtask = subtask_id, age_secs = age.num_seconds(), "cache entry expired");
            return None;
        }

        entry.accessed_at = Utc::now();
        // Touch failure is not a miss; the blueprint itself is valid.
        let _ = self.write_entry(&path, &entry);
        debug!(subtask = subtask_id, "blueprint cache hit");
        Some(entry.prp)
    }

    /// Persist a freshly generated blueprint.
    pub fn store(
        &self,
        subtask_id: &str,
        key: &str,
        blueprint: &Blueprint,
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        let entry = CacheEntry {
            task_id: subtask_id.to_string(),
            task_hash: key.to_string(),
            created_at: now,
            accessed_at: now,
            version: CACHE_VERSION,
            prp: blueprint.clone(),
            compression_level: None,
            input_tokens: None,
            output_tokens: None,
            compression_ratio: None,
            original_size: None,
            compressed_size: None,
        };
        self.write_entry(&self.entry_path(subtask_id), &entry)
    }

    fn write_entry(&self, path: &Path, entry: &CacheEntry) -> Result<(), SessionError> {
        let json = serde_json::to_string_pretty(entry)
            .map_err(|e| SessionError::Schema(crate::errors::SchemaError::Json(e)))?;
        write_atomic(path, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemId;
    use crate::model::fixtures::{contract_block, linear_backlog};
    use crate::prp::blueprint::test_support::blueprint_json;
    use tempfile::tempdir;

    fn subtask() -> Subtask {
        linear_backlog(1).backlog[0].milestones[0].tasks[0].subtasks[0].clone()
    }

    fn blueprint() -> Blueprint {
        Blueprint::from_response(blueprint_json()).unwrap()
    }

    #[test]
    fn test_cache_key_is_stable() {
        assert_eq!(cache_key(&subtask()), cache_key(&subtask()));
    }

    #[test]
    fn test_cache_key_changes_with_definition() {
        let base = subtask();
        let mut renamed = base.clone();
        renamed.title = "Different".to_string();
        assert_ne!(cache_key(&base), cache_key(&renamed));

        let mut repointed = base.clone();
        repointed.dependencies = vec![ItemId::parse("P1.M1.T1.S9").unwrap()];
        assert_ne!(cache_key(&base), cache_key(&repointed));

        let mut rescoped = base.clone();
        rescoped.context_scope = contract_block().replace("none", "changed");
        assert_ne!(cache_key(&base), cache_key(&rescoped));
    }

    #[test]
    fn test_cache_key_ignores_dependency_order() {
        let mut a = subtask();
        a.dependencies = vec![
            ItemId::parse("P1.M1.T1.S2").unwrap(),
            ItemId::parse("P1.M1.T1.S3").unwrap(),
        ];
        let mut b = subtask();
        b.dependencies = vec![
            ItemId::parse("P1.M1.T1.S3").unwrap(),
            ItemId::parse("P1.M1.T1.S2").unwrap(),
        ];
        assert_eq!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn test_store_then_lookup_hits() {
        let dir = tempdir().unwrap();
        let cache = PrpCache::new(dir.path(), Duration::from_secs(3600));
        let key = cache_key(&subtask());
        cache.store("P1.M1.T1.S1", &key, &blueprint()).unwrap();

        let hit = cache.lookup("P1.M1.T1.S1", &key).unwrap();
        assert_eq!(hit, blueprint());
    }

    #[test]
    fn test_lookup_misses_on_key_change() {
        let dir = tempdir().unwrap();
        let cache = PrpCache::new(dir.path(), Duration::from_secs(3600));
        cache.store("P1.M1.T1.S1", "old-key", &blueprint()).unwrap();
        assert!(cache.lookup("P1.M1.T1.S1", "new-key").is_none());
    }

    #[test]
    fn test_lookup_misses_on_expired_entry() {
        let dir = tempdir().unwrap();
        let cache = PrpCache::new(dir.path(), Duration::from_secs(0));
        cache.store("P1.M1.T1.S1", "key", &blueprint()).unwrap();
        assert!(cache.lookup("P1.M1.T1.S1", "key").is_none());
    }

    #[test]
    fn test_lookup_touches_access_timestamp() {
        let dir = tempdir().unwrap();
        let cache = PrpCache::new(dir.path(), Duration::from_secs(3600));
        cache.store("P1.M1.T1.S1", "key", &blueprint()).unwrap();

        let path = dir.path().join("P1.M1.T1.S1.json");
        let before: CacheEntry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        cache.lookup("P1.M1.T1.S1", "key").unwrap();
        let after: CacheEntry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(after.accessed_at > before.accessed_at);
        assert_eq!(after.created_at, before.created_at);
    }

    #[test]
    fn test_reader_defaults_missing_optional_fields() {
        let json = serde_json::json!({
            "taskId": "P1.M1.T1.S1",
            "taskHash": "abc",
            "createdAt": "2026-01-01T00:00:00Z",
            "accessedAt": "2026-01-01T00:00:00Z",
            "prp": blueprint_json()
        });
        let entry: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.version, 0);
        assert!(entry.compression_level.is_none());
        assert!(entry.input_tokens.is_none());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let cache = PrpCache::new(dir.path(), Duration::from_secs(3600));
        std::fs::write(dir.path().join("P1.M1.T1.S1.json"), "not json").unwrap();
        assert!(cache.lookup("P1.M1.T1.S1", "key").is_none());
    }
}
