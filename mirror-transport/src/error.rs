//! Error types for mirror-transport.

use thiserror::Error;

use mirror_core::ViewerId;

/// All errors that can arise from the broadcast layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No live or grace-retained subscription for this viewer.
    #[error("unknown viewer {id}")]
    UnknownViewer { id: ViewerId },

    /// The subscription outlived its disconnect grace period; the viewer
    /// must subscribe again and backfill.
    #[error("subscription for viewer {id} expired")]
    SubscriptionExpired { id: ViewerId },
}
