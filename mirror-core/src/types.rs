//! Domain types for the mirror engine.
//!
//! All path fields use `PathBuf` for filesystem paths; mirrored resource
//! paths are logical slash-separated keys and use [`ResourcePath`].
//! All types are serializable/deserializable via serde.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed identifier for one command-execution session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Mint a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Logical path of a mirrored resource (file or command-output blob).
///
/// Slash-separated, independent of any target's on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourcePath(pub String);

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ResourcePath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResourcePath {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed identifier for a mirror target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed identifier for a connected viewer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewerId(pub String);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ViewerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ViewerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a command-execution session.
///
/// Legal transitions: Pending → Running → Streaming → {Completed, Failed};
/// any non-terminal state → Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Running,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Completed, Failed and Cancelled are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Running => "running",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Which output stream a chunk was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Payload kind of an [`OutputChunk`].
///
/// `Truncated` marks the point where older chunks were evicted from the
/// bounded capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    #[default]
    Data,
    Truncated,
}

/// Category of a mirror target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    LocalDir,
    RemoteSsh,
    CloudStore,
    ViewerSocket,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetKind::LocalDir => "local_dir",
            TargetKind::RemoteSsh => "remote_ssh",
            TargetKind::CloudStore => "cloud_store",
            TargetKind::ViewerSocket => "viewer_socket",
        };
        write!(f, "{s}")
    }
}

/// Health of a mirror target, walked by the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealth {
    #[default]
    Online,
    Degraded,
    Offline,
}

impl fmt::Display for TargetHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetHealth::Online => "online",
            TargetHealth::Degraded => "degraded",
            TargetHealth::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// Where a [`SyncEvent`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOrigin {
    /// Captured command output persisted as a resource.
    Command,
    /// Direct `enqueue_sync` call through the public API.
    Api,
    /// Produced by `restore`; re-enters the normal pipeline.
    Restore,
    /// Replay of a parked event after a target recovered.
    Replay,
}

/// How a conflict was (or will be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merged,
    ManualPending,
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One command execution instance. Owned exclusively by the session
/// registry; everything else sees read-only clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub command: String,
    /// Absolute path the command runs in.
    pub working_dir: PathBuf,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub owner: String,
    /// Cooperative cancellation has been requested but not yet honoured.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Annotation for forced transitions (e.g. `TimeoutOnCancel`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// An immutable slice of captured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub session_id: SessionId,
    /// Monotonic per (session, stream).
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
    pub stream: StreamKind,
    #[serde(default)]
    pub kind: ChunkKind,
}

/// A sync destination, created from configuration.
///
/// Holds only id + configuration; health and queues live in the sync
/// manager, so targets never point back at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorTarget {
    pub id: TargetId,
    pub kind: TargetKind,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub health: TargetHealth,
}

/// Current head state of one mirrored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredResource {
    pub path: ResourcePath,
    /// SHA-256 hex digest of the current content.
    pub content_hash: String,
    /// Strictly increasing; 0 means "does not exist yet".
    pub version: u64,
    pub last_writer: String,
    pub last_modified_at: DateTime<Utc>,
}

/// A proposed change to a resource's content. Transient: consumed exactly
/// once, either applied or converted into a [`ConflictRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: String,
    pub resource_path: ResourcePath,
    /// Version the writer believed was current when producing the payload.
    pub base_version: u64,
    pub proposed_version: u64,
    pub payload: Vec<u8>,
    pub origin: SyncOrigin,
}

impl SyncEvent {
    pub fn new(
        resource_path: ResourcePath,
        base_version: u64,
        payload: Vec<u8>,
        origin: SyncOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource_path,
            base_version,
            proposed_version: base_version + 1,
            payload,
            origin,
        }
    }
}

/// Audit record of a divergence between two writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub resource_path: ResourcePath,
    /// Version held locally when the divergence was detected.
    pub local_version: u64,
    /// Version the conflicting event diverged at.
    pub remote_version: u64,
    pub resolution: Resolution,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// Still awaiting a manual decision.
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::ManualPending && self.resolved_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(ResourcePath::from("src/main.rs").to_string(), "src/main.rs");
        assert_eq!(TargetId::from("t-1").to_string(), "t-1");
        assert_eq!(ViewerId::from("v-1").to_string(), "v-1");
    }

    #[test]
    fn newtype_equality() {
        let a = ResourcePath::from("x");
        let b = ResourcePath::from(String::from("x"));
        assert_eq!(a, b);
    }

    #[test]
    fn generated_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(!SessionState::Pending.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
    }

    #[test]
    fn sync_event_proposes_next_version() {
        let event = SyncEvent::new(ResourcePath::from("a.txt"), 3, b"x".to_vec(), SyncOrigin::Api);
        assert_eq!(event.proposed_version, 4);
    }

    #[test]
    fn chunk_serde_roundtrip() {
        let chunk = OutputChunk {
            session_id: SessionId::from("s1"),
            sequence: 0,
            timestamp: Utc::now(),
            bytes: b"hi\n".to_vec(),
            stream: StreamKind::Stdout,
            kind: ChunkKind::Data,
        };
        let json = serde_json::to_string(&chunk).expect("serialize");
        let back: OutputChunk = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(chunk, back);
    }

    #[test]
    fn target_kind_display() {
        assert_eq!(TargetKind::LocalDir.to_string(), "local_dir");
        assert_eq!(TargetKind::ViewerSocket.to_string(), "viewer_socket");
    }
}
