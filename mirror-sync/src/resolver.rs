//! Conflict resolver — detection, policy resolution, and the audit log.
//!
//! A conflict exists when a [`SyncEvent`]'s `base_version` diverges from the
//! resource's current version and the payload is not an idempotent
//! fast-forward. Resolution policies: `LocalWins`, `RemoteWins`, and
//! `Merged` (line-based three-way merge against the common ancestor;
//! overlapping hunks leave a `ManualPending` record preserving both sides).
//!
//! Every resolution is appended to an immutable audit log for
//! rollback/inspection; pending records additionally retain the remote
//! payload until a manual decision is made.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::Utc;
use similar::{DiffTag, TextDiff};

use mirror_core::{ConflictRecord, MirroredResource, Resolution, ResourcePath, SyncEvent};

use crate::error::SyncError;
use crate::store::content_hash;

/// Resolution policy for a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    LocalWins,
    RemoteWins,
    Merged,
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub record: ConflictRecord,
    /// Content that should become a new version of the resource, when the
    /// policy produced one (`RemoteWins`, successful `Merged`).
    pub merged_payload: Option<Vec<u8>>,
}

#[derive(Debug)]
struct PendingConflict {
    resource_path: ResourcePath,
    /// Remote side preserved verbatim until the manual decision.
    remote_payload: Vec<u8>,
}

/// Conflict detection, resolution, and audit trail for one engine instance.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    records: Mutex<Vec<ConflictRecord>>,
    pending: Mutex<Vec<PendingConflict>>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `event` diverges from `current` — stale base version and
    /// not an idempotent fast-forward (payload identical to the head).
    pub fn detect(&self, event: &SyncEvent, current: &MirroredResource) -> bool {
        event.base_version != current.version
            && content_hash(&event.payload) != current.content_hash
    }

    /// Default policy by payload kind: line-mergeable text → `Merged`,
    /// opaque binary → `LocalWins` (merge is undefined for binaries).
    pub fn default_policy(payload: &[u8]) -> MergePolicy {
        if is_text(payload) {
            MergePolicy::Merged
        } else {
            MergePolicy::LocalWins
        }
    }

    /// Resolve a divergence between the resource head (`local`) and an
    /// event payload (`remote`), both descended from `ancestor`.
    pub fn resolve(
        &self,
        path: &ResourcePath,
        local_version: u64,
        remote_version: u64,
        ancestor: &[u8],
        local: &[u8],
        remote: &[u8],
        policy: MergePolicy,
    ) -> ResolutionOutcome {
        let now = Utc::now();
        let (resolution, merged_payload, resolved_at) = match policy {
            MergePolicy::LocalWins => (Resolution::LocalWins, None, Some(now)),
            MergePolicy::RemoteWins => {
                (Resolution::RemoteWins, Some(remote.to_vec()), Some(now))
            }
            MergePolicy::Merged => {
                match merge3(
                    &String::from_utf8_lossy(ancestor),
                    &String::from_utf8_lossy(local),
                    &String::from_utf8_lossy(remote),
                ) {
                    Some(merged) => (Resolution::Merged, Some(merged.into_bytes()), Some(now)),
                    None => (Resolution::ManualPending, None, None),
                }
            }
        };

        let record = ConflictRecord {
            resource_path: path.clone(),
            local_version,
            remote_version,
            resolution,
            detected_at: now,
            resolved_at,
        };

        if record.resolution == Resolution::ManualPending {
            self.lock_pending().push(PendingConflict {
                resource_path: path.clone(),
                remote_payload: remote.to_vec(),
            });
        }
        self.lock_records().push(record.clone());

        ResolutionOutcome {
            record,
            merged_payload,
        }
    }

    /// Settle the oldest pending conflict for `path` with a manual choice.
    ///
    /// Returns the updated record and, for `RemoteWins`, the preserved
    /// remote payload the caller must re-apply through the pipeline.
    pub fn resolve_pending(
        &self,
        path: &ResourcePath,
        choice: Resolution,
    ) -> Result<(ConflictRecord, Option<Vec<u8>>), SyncError> {
        if !matches!(choice, Resolution::LocalWins | Resolution::RemoteWins) {
            return Err(SyncError::InvalidResolutionChoice { path: path.clone() });
        }

        let payload = {
            let mut pending = self.lock_pending();
            let position = pending
                .iter()
                .position(|p| &p.resource_path == path)
                .ok_or_else(|| SyncError::NoPendingConflict { path: path.clone() })?;
            pending.remove(position).remote_payload
        };

        let mut records = self.lock_records();
        let record = records
            .iter_mut()
            .find(|r| &r.resource_path == path && r.is_pending())
            .ok_or_else(|| SyncError::NoPendingConflict { path: path.clone() })?;
        record.resolution = choice;
        record.resolved_at = Some(Utc::now());
        let record = record.clone();

        let payload = match choice {
            Resolution::RemoteWins => Some(payload),
            _ => None,
        };
        Ok((record, payload))
    }

    /// All records, oldest first (the audit log).
    pub fn records(&self) -> Vec<ConflictRecord> {
        self.lock_records().clone()
    }

    /// Records still awaiting a manual decision.
    pub fn pending(&self) -> Vec<ConflictRecord> {
        self.lock_records()
            .iter()
            .filter(|r| r.is_pending())
            .cloned()
            .collect()
    }

    /// Versions of `path` referenced by unresolved conflicts; retention must
    /// not prune them.
    pub fn protected_versions(&self, path: &ResourcePath) -> HashSet<u64> {
        self.lock_records()
            .iter()
            .filter(|r| &r.resource_path == path && r.is_pending())
            .flat_map(|r| [r.local_version, r.remote_version])
            .collect()
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Vec<ConflictRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<PendingConflict>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Heuristic text check: valid UTF-8 and free of NUL bytes.
fn is_text(payload: &[u8]) -> bool {
    !payload.contains(&0) && std::str::from_utf8(payload).is_ok()
}

// ---------------------------------------------------------------------------
// Three-way merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Edit {
    /// Replaced half-open line range in the ancestor.
    start: usize,
    end: usize,
    lines: Vec<String>,
}

fn split_lines(s: &str) -> Vec<&str> {
    s.split_inclusive('\n').collect()
}

fn collect_edits(old: &[&str], new: &[&str]) -> Vec<Edit> {
    TextDiff::from_slices(old, new)
        .ops()
        .iter()
        .filter_map(|op| match op.tag() {
            DiffTag::Equal => None,
            _ => Some(Edit {
                start: op.old_range().start,
                end: op.old_range().end,
                lines: new[op.new_range()].iter().map(|s| s.to_string()).collect(),
            }),
        })
        .collect()
}

/// Edits conflict when their ancestor ranges overlap or touch. Touching
/// counts: two different insertions at the same point have no safe order.
fn edits_collide(a: &Edit, b: &Edit) -> bool {
    a.start <= b.end && b.start <= a.end
}

/// Line-based three-way merge of `local` and `remote` against `ancestor`.
///
/// Returns `None` when the two sides edit overlapping regions differently —
/// the caller records a `ManualPending` conflict.
pub fn merge3(ancestor: &str, local: &str, remote: &str) -> Option<String> {
    let a = split_lines(ancestor);
    let l = split_lines(local);
    let r = split_lines(remote);

    let local_edits = collect_edits(&a, &l);
    let remote_edits = collect_edits(&a, &r);

    let mut out = String::new();
    let mut cursor = 0usize;
    let (mut li, mut ri) = (0usize, 0usize);

    let mut apply = |edit: &Edit, cursor: &mut usize, out: &mut String| {
        for line in &a[*cursor..edit.start] {
            out.push_str(line);
        }
        for line in &edit.lines {
            out.push_str(line);
        }
        *cursor = edit.end;
    };

    loop {
        match (local_edits.get(li), remote_edits.get(ri)) {
            (None, None) => {
                for line in &a[cursor..] {
                    out.push_str(line);
                }
                return Some(out);
            }
            (Some(edit), None) => {
                apply(edit, &mut cursor, &mut out);
                li += 1;
            }
            (None, Some(edit)) => {
                apply(edit, &mut cursor, &mut out);
                ri += 1;
            }
            (Some(le), Some(re)) => {
                if le == re {
                    // Both sides made the same change; take it once.
                    apply(le, &mut cursor, &mut out);
                    li += 1;
                    ri += 1;
                } else if edits_collide(le, re) {
                    return None;
                } else if le.start <= re.start {
                    apply(le, &mut cursor, &mut out);
                    li += 1;
                } else {
                    apply(re, &mut cursor, &mut out);
                    ri += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use mirror_core::SyncOrigin;

    use super::*;

    fn rp(s: &str) -> ResourcePath {
        ResourcePath::from(s)
    }

    fn head(path: &str, version: u64, content: &[u8]) -> MirroredResource {
        MirroredResource {
            path: rp(path),
            content_hash: content_hash(content),
            version,
            last_writer: "w".to_string(),
            last_modified_at: Utc::now(),
        }
    }

    // -- detection ---------------------------------------------------------

    #[test]
    fn matching_base_version_is_not_a_conflict() {
        let resolver = ConflictResolver::new();
        let current = head("a.txt", 2, b"two");
        let event = SyncEvent::new(rp("a.txt"), 2, b"three".to_vec(), SyncOrigin::Api);
        assert!(!resolver.detect(&event, &current));
    }

    #[test]
    fn stale_base_version_is_a_conflict() {
        let resolver = ConflictResolver::new();
        let current = head("a.txt", 2, b"two");
        let event = SyncEvent::new(rp("a.txt"), 1, b"divergent".to_vec(), SyncOrigin::Api);
        assert!(resolver.detect(&event, &current));
    }

    #[test]
    fn identical_payload_is_a_fast_forward_not_a_conflict() {
        let resolver = ConflictResolver::new();
        let current = head("a.txt", 2, b"two");
        let event = SyncEvent::new(rp("a.txt"), 1, b"two".to_vec(), SyncOrigin::Api);
        assert!(!resolver.detect(&event, &current));
    }

    // -- policies ----------------------------------------------------------

    #[test]
    fn default_policy_is_merged_for_text_local_wins_for_binary() {
        assert_eq!(
            ConflictResolver::default_policy(b"plain text\n"),
            MergePolicy::Merged
        );
        assert_eq!(
            ConflictResolver::default_policy(&[0u8, 159, 146, 150]),
            MergePolicy::LocalWins
        );
    }

    #[test]
    fn local_wins_records_without_payload() {
        let resolver = ConflictResolver::new();
        let outcome = resolver.resolve(
            &rp("a.bin"),
            3,
            2,
            b"base",
            b"local",
            b"remote",
            MergePolicy::LocalWins,
        );
        assert_eq!(outcome.record.resolution, Resolution::LocalWins);
        assert!(outcome.record.resolved_at.is_some());
        assert!(outcome.merged_payload.is_none());
        assert_eq!(resolver.records().len(), 1);
        assert!(resolver.pending().is_empty());
    }

    #[test]
    fn remote_wins_returns_remote_payload() {
        let resolver = ConflictResolver::new();
        let outcome = resolver.resolve(
            &rp("a.txt"),
            3,
            2,
            b"base",
            b"local",
            b"remote",
            MergePolicy::RemoteWins,
        );
        assert_eq!(outcome.record.resolution, Resolution::RemoteWins);
        assert_eq!(outcome.merged_payload.as_deref(), Some(b"remote".as_ref()));
    }

    #[test]
    fn disjoint_edits_merge_cleanly() {
        let resolver = ConflictResolver::new();
        let ancestor = b"one\ntwo\nthree\nfour\n";
        let local = b"ONE\ntwo\nthree\nfour\n";
        let remote = b"one\ntwo\nthree\nFOUR\n";
        let outcome = resolver.resolve(
            &rp("a.txt"),
            2,
            2,
            ancestor,
            local,
            remote,
            MergePolicy::Merged,
        );
        assert_eq!(outcome.record.resolution, Resolution::Merged);
        assert_eq!(
            outcome.merged_payload.as_deref(),
            Some(b"ONE\ntwo\nthree\nFOUR\n".as_ref())
        );
    }

    #[test]
    fn overlapping_edits_go_manual_pending() {
        let resolver = ConflictResolver::new();
        let outcome = resolver.resolve(
            &rp("a.txt"),
            2,
            2,
            b"line\n",
            b"local line\n",
            b"remote line\n",
            MergePolicy::Merged,
        );
        assert_eq!(outcome.record.resolution, Resolution::ManualPending);
        assert!(outcome.record.resolved_at.is_none());
        assert!(outcome.merged_payload.is_none());
        assert_eq!(resolver.pending().len(), 1);
    }

    #[test]
    fn manual_remote_wins_hands_back_preserved_payload() {
        let resolver = ConflictResolver::new();
        resolver.resolve(
            &rp("a.txt"),
            2,
            2,
            b"line\n",
            b"local line\n",
            b"remote line\n",
            MergePolicy::Merged,
        );

        let (record, payload) = resolver
            .resolve_pending(&rp("a.txt"), Resolution::RemoteWins)
            .expect("resolve_pending");
        assert_eq!(record.resolution, Resolution::RemoteWins);
        assert!(record.resolved_at.is_some());
        assert_eq!(payload.as_deref(), Some(b"remote line\n".as_ref()));
        assert!(resolver.pending().is_empty());
        // Audit log keeps the settled record.
        assert_eq!(resolver.records().len(), 1);
    }

    #[test]
    fn manual_resolution_rejects_merged_choice() {
        let resolver = ConflictResolver::new();
        resolver.resolve(
            &rp("a.txt"),
            2,
            2,
            b"l\n",
            b"a\n",
            b"b\n",
            MergePolicy::Merged,
        );
        let err = resolver
            .resolve_pending(&rp("a.txt"), Resolution::Merged)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidResolutionChoice { .. }));
    }

    #[test]
    fn resolve_pending_without_conflict_errors() {
        let resolver = ConflictResolver::new();
        let err = resolver
            .resolve_pending(&rp("clean.txt"), Resolution::LocalWins)
            .unwrap_err();
        assert!(matches!(err, SyncError::NoPendingConflict { .. }));
    }

    #[test]
    fn protected_versions_cover_pending_conflicts_only() {
        let resolver = ConflictResolver::new();
        resolver.resolve(
            &rp("a.txt"),
            5,
            3,
            b"l\n",
            b"a\n",
            b"b\n",
            MergePolicy::Merged,
        );
        resolver.resolve(
            &rp("a.txt"),
            6,
            4,
            b"x",
            b"y",
            b"z",
            MergePolicy::LocalWins,
        );

        let protected = resolver.protected_versions(&rp("a.txt"));
        assert_eq!(protected, [5, 3].into_iter().collect());
    }

    // -- merge3 ------------------------------------------------------------

    #[test]
    fn merge_identical_sides_returns_ancestor() {
        let text = "a\nb\nc\n";
        assert_eq!(merge3(text, text, text).as_deref(), Some(text));
    }

    #[test]
    fn merge_takes_single_sided_change() {
        let ancestor = "a\nb\nc\n";
        let local = "a\nB\nc\n";
        assert_eq!(merge3(ancestor, local, ancestor).as_deref(), Some(local));
        assert_eq!(merge3(ancestor, ancestor, local).as_deref(), Some(local));
    }

    #[test]
    fn merge_combines_insertion_and_deletion() {
        let ancestor = "a\nb\nc\nd\n";
        let local = "start\na\nb\nc\nd\n";
        let remote = "a\nb\nd\n";
        assert_eq!(
            merge3(ancestor, local, remote).as_deref(),
            Some("start\na\nb\nd\n")
        );
    }

    #[test]
    fn merge_same_change_on_both_sides_applies_once() {
        let ancestor = "a\nb\nc\n";
        let both = "a\nX\nc\n";
        assert_eq!(merge3(ancestor, both, both).as_deref(), Some(both));
    }

    #[test]
    fn merge_conflicting_edits_fail() {
        let ancestor = "a\nb\nc\n";
        let local = "a\nL\nc\n";
        let remote = "a\nR\nc\n";
        assert!(merge3(ancestor, local, remote).is_none());
    }

    #[test]
    fn merge_adjacent_insertions_at_same_point_fail() {
        let ancestor = "a\nb\n";
        let local = "a\nL\nb\n";
        let remote = "a\nR\nb\n";
        assert!(merge3(ancestor, local, remote).is_none());
    }

    #[test]
    fn merge_handles_missing_trailing_newline() {
        let ancestor = "a\nb";
        let local = "a\nb";
        let remote = "a\nb\nc";
        assert_eq!(merge3(ancestor, local, remote).as_deref(), Some("a\nb\nc"));
    }
}
