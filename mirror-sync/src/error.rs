//! Error types for mirror-sync.

use std::path::PathBuf;

use thiserror::Error;

use mirror_core::{ResourcePath, TargetId};

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (version index).
    #[error("version index JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The resource has no recorded versions.
    #[error("unknown resource {path}")]
    UnknownResource { path: ResourcePath },

    /// The resource exists but has no such version.
    #[error("resource {path} has no version {version}")]
    UnknownVersion { path: ResourcePath, version: u64 },

    /// Resource paths must be relative and free of parent traversal.
    #[error("invalid resource path '{path}'")]
    InvalidResourcePath { path: ResourcePath },

    /// No target with this id is registered.
    #[error("unknown target {id}")]
    UnknownTarget { id: TargetId },

    /// Delivery to the target failed after retries; it is now counted
    /// against the target's health and the write is parked.
    #[error("target {id} unreachable")]
    TargetUnreachable { id: TargetId },

    /// The resource has no pending conflict to resolve.
    #[error("no pending conflict for {path}")]
    NoPendingConflict { path: ResourcePath },

    /// Manual resolution only accepts local_wins or remote_wins.
    #[error("invalid manual resolution choice for {path}")]
    InvalidResolutionChoice { path: ResourcePath },

    /// An internal channel closed while the engine was still running.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
