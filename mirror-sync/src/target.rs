//! Mirror backends — the uniform write/read/health contract targets expose.
//!
//! The in-tree [`LocalDirBackend`] mirrors resources into a directory with
//! atomic `.tmp` + rename writes. Remote/cloud backends implement the same
//! trait externally; a backend never holds a reference back to the sync
//! manager (targets are resolved by id through the manager's own tables).

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use mirror_core::ResourcePath;

use crate::error::{io_err, SyncError};

/// Uniform contract every sync destination implements.
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    /// Persist `bytes` as the content of `path`. Must be idempotent: writing
    /// identical bytes twice leaves the same observable state.
    async fn write(&self, path: &ResourcePath, bytes: &[u8]) -> Result<(), SyncError>;

    /// Read the current content of `path`.
    async fn read(&self, path: &ResourcePath) -> Result<Vec<u8>, SyncError>;

    /// Cheap liveness probe, driven by the manager's heartbeat loop.
    async fn health(&self) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// LocalDirBackend
// ---------------------------------------------------------------------------

/// Mirrors resources under a local directory.
#[derive(Debug, Clone)]
pub struct LocalDirBackend {
    root: PathBuf,
}

impl LocalDirBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a resource path inside the root.
    ///
    /// Resource paths are logical and relative; absolute paths and parent
    /// traversal are rejected rather than escaping the mirror root.
    fn resolve(&self, path: &ResourcePath) -> Result<PathBuf, SyncError> {
        let relative = Path::new(&path.0);
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(SyncError::InvalidResourcePath { path: path.clone() });
                }
            }
        }
        if resolved == self.root {
            return Err(SyncError::InvalidResourcePath { path: path.clone() });
        }
        Ok(resolved)
    }
}

#[async_trait]
impl MirrorBackend for LocalDirBackend {
    async fn write(&self, path: &ResourcePath, bytes: &[u8]) -> Result<(), SyncError> {
        let dest = self.resolve(path)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let tmp = PathBuf::from(format!("{}.mirror.tmp", dest.display()));
        std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &dest) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&dest, e));
        }
        tracing::debug!("mirrored {} -> {}", path, dest.display());
        Ok(())
    }

    async fn read(&self, path: &ResourcePath) -> Result<Vec<u8>, SyncError> {
        let dest = self.resolve(path)?;
        std::fs::read(&dest).map_err(|e| io_err(&dest, e))
    }

    async fn health(&self) -> Result<(), SyncError> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(io_err(
                &self.root,
                std::io::Error::other("mirror root is not a directory"),
            )),
            Err(e) => Err(io_err(&self.root, e)),
        }
    }
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

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let tmp = TempDir::new().expect("tempdir");
        let backend = LocalDirBackend::new(tmp.path());

        backend
            .write(&rp("src/main.rs"), b"fn main() {}\n")
            .await
            .expect("write");
        let bytes = backend.read(&rp("src/main.rs")).await.expect("read");
        assert_eq!(bytes, b"fn main() {}\n");
        assert!(tmp.path().join("src/main.rs").exists());
    }

    #[tokio::test]
    async fn write_is_idempotent() {
        let tmp = TempDir::new().expect("tempdir");
        let backend = LocalDirBackend::new(tmp.path());
        for _ in 0..2 {
            backend.write(&rp("a.txt"), b"same").await.expect("write");
        }
        assert_eq!(backend.read(&rp("a.txt")).await.expect("read"), b"same");
    }

    #[tokio::test]
    async fn tmp_file_cleaned_up_after_write() {
        let tmp = TempDir::new().expect("tempdir");
        let backend = LocalDirBackend::new(tmp.path());
        backend.write(&rp("a.txt"), b"x").await.expect("write");
        assert!(!tmp.path().join("a.txt.mirror.tmp").exists());
    }

    #[tokio::test]
    async fn parent_traversal_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let backend = LocalDirBackend::new(tmp.path().join("inner"));
        std::fs::create_dir_all(tmp.path().join("inner")).expect("mkdir");

        let err = backend
            .write(&rp("../escape.txt"), b"nope")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidResourcePath { .. }));
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn empty_resource_path_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let backend = LocalDirBackend::new(tmp.path());
        let err = backend.write(&rp(""), b"x").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidResourcePath { .. }));
    }

    #[tokio::test]
    async fn health_fails_when_root_vanishes() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("mirror");
        std::fs::create_dir_all(&root).expect("mkdir");
        let backend = LocalDirBackend::new(&root);
        backend.health().await.expect("healthy");

        std::fs::remove_dir_all(&root).expect("rmdir");
        assert!(backend.health().await.is_err());
    }
}
