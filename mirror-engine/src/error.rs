//! Error types for mirror-engine.

use thiserror::Error;

use mirror_capture::{AdapterError, CaptureError};
use mirror_core::{ConfigError, SessionError};
use mirror_sync::SyncError;
use mirror_transport::TransportError;

/// All errors that can surface through the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal at startup. Every violation is listed, not just the first.
    #[error("configuration error ({} violation(s)): {}", violations.len(), violations.join("; "))]
    Configuration { violations: Vec<String> },

    /// Error loading the configuration file itself.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An error from the session registry.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// An error from result capture.
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// An error from the platform command adapter.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// An error from the sync layer.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// An error from the broadcast layer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An internal channel closed while the engine was still running.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
