//! Version controller — append-only, content-addressed snapshot store.
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//!   index.json            (path → version entries — atomic .tmp + rename)
//!   <hh>/<content_hash>   (snapshot bytes, hh = first two hex chars)
//! ```
//!
//! Identical content across versions (or resources) is stored once.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use mirror_core::{MirroredResource, ResourcePath, SyncEvent, SyncOrigin};

use crate::error::{io_err, SyncError};

/// SHA-256 hex digest of `bytes` — the workspace-wide content address.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// One recorded version of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u64,
    pub content_hash: String,
    pub writer: String,
    pub recorded_at: DateTime<Utc>,
}

/// On-disk index payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexFile {
    /// Keyed by resource path; entries kept in ascending version order.
    resources: BTreeMap<String, Vec<VersionEntry>>,
}

/// Content-addressed version store rooted at one directory.
#[derive(Debug)]
pub struct VersionStore {
    root: PathBuf,
    index: Mutex<IndexFile>,
}

impl VersionStore {
    /// Open (or initialize) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;

        let index_path = index_path(&root);
        let index = if index_path.exists() {
            let contents =
                std::fs::read_to_string(&index_path).map_err(|e| io_err(&index_path, e))?;
            serde_json::from_str(&contents)?
        } else {
            IndexFile::default()
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    /// Record `content` as `version` of `path`.
    ///
    /// The snapshot object is written once per distinct hash; the index
    /// entry is appended and persisted atomically.
    pub fn snapshot(
        &self,
        path: &ResourcePath,
        version: u64,
        content: &[u8],
        writer: &str,
    ) -> Result<VersionEntry, SyncError> {
        let hash = content_hash(content);
        self.write_object(&hash, content)?;

        let entry = VersionEntry {
            version,
            content_hash: hash,
            writer: writer.to_string(),
            recorded_at: Utc::now(),
        };

        let mut index = self.lock();
        index
            .resources
            .entry(path.0.clone())
            .or_default()
            .push(entry.clone());
        self.save_index(&index)?;
        Ok(entry)
    }

    /// Current head version of `path`; 0 when the resource is unknown.
    pub fn version(&self, path: &ResourcePath) -> u64 {
        self.lock()
            .resources
            .get(&path.0)
            .and_then(|entries| entries.last().map(|e| e.version))
            .unwrap_or(0)
    }

    /// Current head state of `path`.
    pub fn resource(&self, path: &ResourcePath) -> Option<MirroredResource> {
        self.lock().resources.get(&path.0).and_then(|entries| {
            entries.last().map(|e| MirroredResource {
                path: path.clone(),
                content_hash: e.content_hash.clone(),
                version: e.version,
                last_writer: e.writer.clone(),
                last_modified_at: e.recorded_at,
            })
        })
    }

    /// Version history, newest first, capped at `limit`.
    pub fn history(&self, path: &ResourcePath, limit: usize) -> Vec<VersionEntry> {
        let index = self.lock();
        let Some(entries) = index.resources.get(&path.0) else {
            return Vec::new();
        };
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Snapshot bytes of one recorded version.
    pub fn content(&self, path: &ResourcePath, version: u64) -> Result<Vec<u8>, SyncError> {
        let hash = {
            let index = self.lock();
            let entries = index
                .resources
                .get(&path.0)
                .ok_or_else(|| SyncError::UnknownResource { path: path.clone() })?;
            entries
                .iter()
                .find(|e| e.version == version)
                .map(|e| e.content_hash.clone())
                .ok_or_else(|| SyncError::UnknownVersion {
                    path: path.clone(),
                    version,
                })?
        };
        let object = self.object_path(&hash);
        std::fs::read(&object).map_err(|e| io_err(&object, e))
    }

    /// Build a restore event for an old version.
    ///
    /// The event re-enters the normal sync pipeline (`origin = Restore`)
    /// against the current head, so it is subject to the same conflict
    /// rules as any other write.
    pub fn restore(&self, path: &ResourcePath, version: u64) -> Result<SyncEvent, SyncError> {
        let content = self.content(path, version)?;
        let base = self.version(path);
        Ok(SyncEvent::new(path.clone(), base, content, SyncOrigin::Restore))
    }

    /// Prune old versions of `path`, keeping the newest `keep` entries plus
    /// everything in `protected` (versions referenced by unresolved
    /// conflicts). Unreferenced snapshot objects are deleted afterwards.
    ///
    /// Returns the number of index entries removed.
    pub fn prune(
        &self,
        path: &ResourcePath,
        keep: usize,
        protected: &HashSet<u64>,
    ) -> Result<usize, SyncError> {
        let mut index = self.lock();
        let Some(entries) = index.resources.get_mut(&path.0) else {
            return Ok(0);
        };

        let total = entries.len();
        if total <= keep {
            return Ok(0);
        }
        let cutoff = total - keep;
        let mut removed = 0usize;
        let mut kept = Vec::with_capacity(keep);
        for (i, entry) in entries.drain(..).enumerate() {
            if i < cutoff && !protected.contains(&entry.version) {
                removed += 1;
            } else {
                kept.push(entry);
            }
        }
        *entries = kept;

        if removed > 0 {
            self.save_index(&index)?;
            self.collect_garbage(&index)?;
        }
        Ok(removed)
    }

    // -- internals ---------------------------------------------------------

    fn object_path(&self, hash: &str) -> PathBuf {
        let prefix = &hash[..2.min(hash.len())];
        self.root.join(prefix).join(hash)
    }

    fn write_object(&self, hash: &str, content: &[u8]) -> Result<(), SyncError> {
        let path = self.object_path(hash);
        if path.exists() {
            // Content-addressed: same hash, same bytes.
            return Ok(());
        }
        let Some(dir) = path.parent() else {
            return Err(io_err(&path, std::io::Error::other("invalid object path")));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    fn save_index(&self, index: &IndexFile) -> Result<(), SyncError> {
        let path = index_path(&self.root);
        let json = serde_json::to_string_pretty(index)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Delete snapshot objects no longer referenced by any index entry.
    fn collect_garbage(&self, index: &IndexFile) -> Result<(), SyncError> {
        let live: HashSet<&str> = index
            .resources
            .values()
            .flatten()
            .map(|e| e.content_hash.as_str())
            .collect();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => return Err(io_err(&self.root, e)),
        };
        for dir_entry in entries.filter_map(|e| e.ok()) {
            if !dir_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let objects = match std::fs::read_dir(dir_entry.path()) {
                Ok(objects) => objects,
                Err(_) => continue,
            };
            for object in objects.filter_map(|e| e.ok()) {
                let name = object.file_name();
                let hash = name.to_string_lossy();
                if !live.contains(hash.as_ref()) {
                    tracing::debug!("pruning unreferenced snapshot {}", hash);
                    let _ = std::fs::remove_file(object.path());
                }
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexFile> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn index_path(root: &Path) -> PathBuf {
    root.join("index.json")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn rp(s: &str) -> ResourcePath {
        ResourcePath::from(s)
    }

    #[test]
    fn version_is_zero_for_unknown_resource() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        assert_eq!(store.version(&rp("nope.txt")), 0);
        assert!(store.resource(&rp("nope.txt")).is_none());
    }

    #[test]
    fn snapshot_then_resource_roundtrip() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        store
            .snapshot(&rp("a.txt"), 1, b"hello", "alice")
            .expect("snapshot");

        let resource = store.resource(&rp("a.txt")).expect("resource");
        assert_eq!(resource.version, 1);
        assert_eq!(resource.last_writer, "alice");
        assert_eq!(resource.content_hash, content_hash(b"hello"));
        assert_eq!(store.content(&rp("a.txt"), 1).expect("content"), b"hello");
    }

    #[test]
    fn identical_content_is_stored_once() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        store.snapshot(&rp("a.txt"), 1, b"same", "w").expect("snapshot");
        store.snapshot(&rp("a.txt"), 2, b"other", "w").expect("snapshot");
        store.snapshot(&rp("a.txt"), 3, b"same", "w").expect("snapshot");

        let hash = content_hash(b"same");
        let object = tmp.path().join(&hash[..2]).join(&hash);
        assert!(object.exists());

        // Two distinct hashes → exactly two objects on disk.
        let mut count = 0;
        for dir in std::fs::read_dir(tmp.path()).expect("read_dir") {
            let dir = dir.expect("entry");
            if dir.file_type().expect("type").is_dir() {
                count += std::fs::read_dir(dir.path()).expect("read_dir").count();
            }
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn history_is_newest_first_and_capped() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        for v in 1..=5u64 {
            store
                .snapshot(&rp("a.txt"), v, format!("v{v}").as_bytes(), "w")
                .expect("snapshot");
        }

        let history = store.history(&rp("a.txt"), 3);
        let versions: Vec<u64> = history.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![5, 4, 3]);
    }

    #[test]
    fn index_survives_reopen() {
        let tmp = TempDir::new().expect("tempdir");
        {
            let store = VersionStore::open(tmp.path()).expect("open");
            store.snapshot(&rp("a.txt"), 1, b"persisted", "w").expect("snapshot");
        }
        let store = VersionStore::open(tmp.path()).expect("reopen");
        assert_eq!(store.version(&rp("a.txt")), 1);
        assert_eq!(
            store.content(&rp("a.txt"), 1).expect("content"),
            b"persisted"
        );
    }

    #[test]
    fn restore_builds_event_against_current_head() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        for v in 1..=5u64 {
            store
                .snapshot(&rp("a.txt"), v, format!("v{v}").as_bytes(), "w")
                .expect("snapshot");
        }

        let event = store.restore(&rp("a.txt"), 1).expect("restore");
        assert_eq!(event.base_version, 5);
        assert_eq!(event.proposed_version, 6);
        assert_eq!(event.payload, b"v1");
        assert_eq!(event.origin, SyncOrigin::Restore);
    }

    #[test]
    fn restore_unknown_version_errors() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        store.snapshot(&rp("a.txt"), 1, b"x", "w").expect("snapshot");
        let err = store.restore(&rp("a.txt"), 9).unwrap_err();
        assert!(matches!(err, SyncError::UnknownVersion { version: 9, .. }));
    }

    #[test]
    fn prune_keeps_newest_and_protected() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        for v in 1..=6u64 {
            store
                .snapshot(&rp("a.txt"), v, format!("v{v}").as_bytes(), "w")
                .expect("snapshot");
        }

        let protected: HashSet<u64> = [2].into_iter().collect();
        let removed = store.prune(&rp("a.txt"), 2, &protected).expect("prune");
        assert_eq!(removed, 3, "v1, v3, v4 removed; v2 protected");

        let versions: Vec<u64> = store
            .history(&rp("a.txt"), 10)
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![6, 5, 2]);

        // Pruned versions are gone from the index and their objects from
        // disk; survivors remain readable.
        assert!(store.content(&rp("a.txt"), 1).is_err());
        let pruned_hash = content_hash(b"v1");
        assert!(!tmp.path().join(&pruned_hash[..2]).join(&pruned_hash).exists());
        assert_eq!(store.content(&rp("a.txt"), 2).expect("content"), b"v2");
        assert_eq!(store.content(&rp("a.txt"), 6).expect("content"), b"v6");
    }

    #[test]
    fn prune_below_keep_is_noop() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        store.snapshot(&rp("a.txt"), 1, b"x", "w").expect("snapshot");
        let removed = store
            .prune(&rp("a.txt"), 5, &HashSet::new())
            .expect("prune");
        assert_eq!(removed, 0);
        assert_eq!(store.version(&rp("a.txt")), 1);
    }

    #[test]
    fn tmp_files_cleaned_up_after_writes() {
        let tmp = TempDir::new().expect("tempdir");
        let store = VersionStore::open(tmp.path()).expect("open");
        store.snapshot(&rp("a.txt"), 1, b"x", "w").expect("snapshot");

        let index_tmp = tmp.path().join("index.json.tmp");
        assert!(!index_tmp.exists(), "index .tmp should be renamed away");
    }
}
