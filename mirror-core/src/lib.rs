//! # mirror-core
//!
//! Domain types, session registry, and configuration for the mirror engine.
//!
//! Construct a [`SessionRegistry`] per engine instance and inject it; there
//! are no process-wide singletons anywhere in the workspace.

pub mod config;
pub mod error;
pub mod session;
pub mod types;

pub use config::{MirrorConfig, RetentionConfig, TargetConfig};
pub use error::{ConfigError, SessionError};
pub use session::{SessionRegistry, TIMEOUT_ON_CANCEL};
pub use types::{
    ChunkKind, ConflictRecord, MirrorTarget, MirroredResource, OutputChunk, Resolution,
    ResourcePath, Session, SessionId, SessionState, StreamKind, SyncEvent, SyncOrigin, TargetHealth,
    TargetId, TargetKind, ViewerId,
};
