//! # mirror-sync
//!
//! Version store, conflict resolver, mirror targets, and the sync manager.
//!
//! Build a [`VersionStore`] and [`ConflictResolver`], hand them to
//! [`SyncManager::new`] together with an outcome channel, then [`enqueue`]
//! changes; the manager serializes per resource, fans out to targets, and
//! routes stale writes through the resolver.
//!
//! [`enqueue`]: SyncManager::enqueue

pub mod error;
pub mod manager;
pub mod resolver;
pub mod store;
pub mod target;

pub use error::SyncError;
pub use manager::{SyncManager, SyncOptions, SyncOutcome};
pub use resolver::{merge3, ConflictResolver, MergePolicy, ResolutionOutcome};
pub use store::{content_hash, VersionEntry, VersionStore};
pub use target::{LocalDirBackend, MirrorBackend};
