//! Viewer wire protocol.
//!
//! Every message a viewer receives is an [`Envelope`]: `{channel, sequence,
//! payload}` with a per-(viewer, channel) monotonic sequence, so gaps are
//! detectable client-side and backfill can be requested from the version
//! controller / result capture.

use std::fmt;

use serde::{Deserialize, Serialize};

use mirror_core::{
    ConflictRecord, MirroredResource, OutputChunk, ResourcePath, SessionId, SyncOrigin,
    TargetHealth, TargetId,
};

/// Delivery channel: one per session, one per resource, and a shared one
/// for target health notices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "key", rename_all = "lowercase")]
pub enum Channel {
    Session(SessionId),
    Resource(ResourcePath),
    Targets,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Session(id) => write!(f, "session:{id}"),
            Channel::Resource(path) => write!(f, "resource:{path}"),
            Channel::Targets => write!(f, "targets"),
        }
    }
}

/// Payload of one viewer message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerPayload {
    /// A captured output chunk.
    Chunk { chunk: OutputChunk },
    /// A resource changed (new applied version).
    SyncEvent {
        resource: MirroredResource,
        origin: SyncOrigin,
    },
    /// A divergence was detected/resolved.
    Conflict { record: ConflictRecord },
    /// A target's health changed (always explicit, never silent).
    TargetHealth {
        target_id: TargetId,
        health: TargetHealth,
    },
}

impl ViewerPayload {
    pub fn chunk(chunk: OutputChunk) -> Self {
        Self::Chunk { chunk }
    }

    pub fn sync_event(resource: MirroredResource, origin: SyncOrigin) -> Self {
        Self::SyncEvent { resource, origin }
    }

    pub fn conflict(record: ConflictRecord) -> Self {
        Self::Conflict { record }
    }

    pub fn target_health(target_id: TargetId, health: TargetHealth) -> Self {
        Self::TargetHealth { target_id, health }
    }

    /// The channel this payload is delivered on.
    pub fn channel(&self) -> Channel {
        match self {
            ViewerPayload::Chunk { chunk } => Channel::Session(chunk.session_id.clone()),
            ViewerPayload::SyncEvent { resource, .. } => {
                Channel::Resource(resource.path.clone())
            }
            ViewerPayload::Conflict { record } => {
                Channel::Resource(record.resource_path.clone())
            }
            ViewerPayload::TargetHealth { .. } => Channel::Targets,
        }
    }
}

/// One delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: Channel,
    /// Monotonic per (viewer, channel), starting at 0.
    pub sequence: u64,
    pub payload: ViewerPayload,
}

/// Interest registration sent with `subscribe`.
///
/// `None` in a dimension means "everything in that dimension".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_paths: Option<Vec<ResourcePath>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ids: Option<Vec<SessionId>>,
}

impl SubscriptionFilter {
    /// Interest in everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn resources(paths: impl IntoIterator<Item = ResourcePath>) -> Self {
        Self {
            resource_paths: Some(paths.into_iter().collect()),
            session_ids: Some(Vec::new()),
        }
    }

    pub fn sessions(ids: impl IntoIterator<Item = SessionId>) -> Self {
        Self {
            resource_paths: Some(Vec::new()),
            session_ids: Some(ids.into_iter().collect()),
        }
    }

    pub fn matches(&self, channel: &Channel) -> bool {
        match channel {
            Channel::Session(id) => self
                .session_ids
                .as_ref()
                .map(|ids| ids.contains(id))
                .unwrap_or(true),
            Channel::Resource(path) => self
                .resource_paths
                .as_ref()
                .map(|paths| paths.contains(path))
                .unwrap_or(true),
            // Health notices go to every viewer.
            Channel::Targets => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use mirror_core::{ChunkKind, StreamKind};

    use super::*;

    #[test]
    fn channel_display() {
        assert_eq!(
            Channel::Session(SessionId::from("s1")).to_string(),
            "session:s1"
        );
        assert_eq!(
            Channel::Resource(ResourcePath::from("a/b.txt")).to_string(),
            "resource:a/b.txt"
        );
    }

    #[test]
    fn chunk_payload_routes_to_session_channel() {
        let payload = ViewerPayload::chunk(OutputChunk {
            session_id: SessionId::from("s9"),
            sequence: 0,
            timestamp: Utc::now(),
            bytes: b"x".to_vec(),
            stream: StreamKind::Stdout,
            kind: ChunkKind::Data,
        });
        assert_eq!(payload.channel(), Channel::Session(SessionId::from("s9")));
    }

    #[test]
    fn default_filter_matches_everything() {
        let filter = SubscriptionFilter::all();
        assert!(filter.matches(&Channel::Session(SessionId::from("s1"))));
        assert!(filter.matches(&Channel::Resource(ResourcePath::from("x"))));
    }

    #[test]
    fn resource_filter_excludes_other_channels() {
        let filter = SubscriptionFilter::resources([ResourcePath::from("a.txt")]);
        assert!(filter.matches(&Channel::Resource(ResourcePath::from("a.txt"))));
        assert!(!filter.matches(&Channel::Resource(ResourcePath::from("b.txt"))));
        assert!(!filter.matches(&Channel::Session(SessionId::from("s1"))));
    }

    #[test]
    fn envelope_serde_is_tagged() {
        let envelope = Envelope {
            channel: Channel::Resource(ResourcePath::from("a.txt")),
            sequence: 7,
            payload: ViewerPayload::target_health(TargetId::from("t1"), TargetHealth::Offline),
        };
        let json = serde_json::to_string(&envelope).expect("serialize");
        assert!(json.contains("\"type\":\"target_health\""));
        assert!(json.contains("\"sequence\":7"));
        let back: Envelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.sequence, 7);
    }
}
