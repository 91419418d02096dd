//! Error types for mirror-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{SessionId, SessionState};

/// All errors that can arise from session registry operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested working directory does not exist or is not a directory.
    #[error("invalid working directory: {path}")]
    InvalidWorkingDirectory { path: PathBuf },

    /// No session with this id is registered.
    #[error("unknown session {id}")]
    UnknownSession { id: SessionId },

    /// The requested transition is not in the legal state graph.
    /// The session is left untouched.
    #[error("invalid state transition for session {id}: {from} -> {to}")]
    InvalidStateTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
}

/// All errors that can arise from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure reading the config file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error, with the offending path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None` — cannot derive a default root.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}
