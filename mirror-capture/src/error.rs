//! Error types for mirror-capture.

use thiserror::Error;

use mirror_core::SessionId;

/// All errors that can arise from the platform command adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The command could not be spawned at all.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error while streaming from or signalling the process.
    #[error("adapter I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// All errors that can arise from result capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// `ingest` after `finalize` — the stream is closed.
    #[error("session {id} is closed")]
    SessionClosed { id: SessionId },

    /// The session has never produced output and was never finalized.
    #[error("unknown session {id}")]
    UnknownSession { id: SessionId },
}
