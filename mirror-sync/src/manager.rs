//! Sync manager — the orchestrator.
//!
//! One worker task per resource path consumes events in arrival order (the
//! system's only mandatory serialization point); distinct resources proceed
//! concurrently. The manager owns all target state: health counters, parked
//! queues, and per-path delivered hashes. Nothing here is a singleton — the
//! engine constructs one manager per instance and injects it.
//!
//! Delivery guarantees: at-least-once, idempotent by content hash. A write
//! that cannot be delivered is parked, never dropped; parked writes replay
//! in original order before their target returns Online.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;

use mirror_core::{
    ConflictRecord, MirrorTarget, MirroredResource, Resolution, ResourcePath, SyncEvent,
    SyncOrigin, TargetHealth, TargetId,
};

use crate::error::SyncError;
use crate::resolver::ConflictResolver;
use crate::store::{content_hash, VersionStore};
use crate::target::MirrorBackend;

/// Consecutive failures (heartbeat or delivery) before a target is Offline.
const OFFLINE_AFTER: u32 = 3;
/// Delivery attempts per write before the event is parked.
const DELIVERY_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Tuning knobs injected by the engine.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub heartbeat_timeout: Duration,
    /// Snapshot versions kept per resource (conflict-referenced versions
    /// always survive).
    pub retention_keep: usize,
}

/// Observer notification emitted after each processed event or health
/// change. The engine pumps these into the transport layer.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// A new version was recorded and fanned out.
    Applied {
        resource: MirroredResource,
        origin: SyncOrigin,
    },
    /// The payload already matches the head — idempotent no-op.
    FastForward { path: ResourcePath, version: u64 },
    /// A divergence was detected; the record tells how it was settled.
    Conflicted { record: ConflictRecord },
    /// A target's health changed.
    TargetHealth { id: TargetId, health: TargetHealth },
    /// A write was parked for an unreachable target.
    Parked { id: TargetId, path: ResourcePath },
    /// Parked writes replayed after a target recovered.
    Replayed { id: TargetId, replayed: usize },
}

#[derive(Debug, Clone)]
struct ParkedWrite {
    path: ResourcePath,
    bytes: Vec<u8>,
    content_hash: String,
}

/// An event plus the target subset it fans out to (`None` = every target).
#[derive(Debug, Clone)]
struct QueuedEvent {
    event: SyncEvent,
    targets: Option<Vec<TargetId>>,
}

struct TargetRuntime {
    target: MirrorTarget,
    backend: Arc<dyn MirrorBackend>,
    failures: u32,
    parked: VecDeque<ParkedWrite>,
    /// Last content hash delivered per path — the idempotence key.
    delivered: HashMap<ResourcePath, String>,
}

struct Inner {
    store: Arc<VersionStore>,
    resolver: Arc<ConflictResolver>,
    targets: RwLock<HashMap<TargetId, TargetRuntime>>,
    workers: Mutex<HashMap<ResourcePath, mpsc::Sender<QueuedEvent>>>,
    outcome_tx: mpsc::Sender<SyncOutcome>,
    options: SyncOptions,
    inflight: AtomicUsize,
}

/// Handle to the sync orchestrator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(
        store: Arc<VersionStore>,
        resolver: Arc<ConflictResolver>,
        outcome_tx: mpsc::Sender<SyncOutcome>,
        options: SyncOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                resolver,
                targets: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                outcome_tx,
                options,
                inflight: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a sync destination.
    pub async fn add_target(&self, target: MirrorTarget, backend: Arc<dyn MirrorBackend>) {
        let mut targets = self.inner.targets.write().await;
        targets.insert(
            target.id.clone(),
            TargetRuntime {
                target,
                backend,
                failures: 0,
                parked: VecDeque::new(),
                delivered: HashMap::new(),
            },
        );
    }

    /// Wrap a change as a [`SyncEvent`] against the currently known version
    /// and hand it to the resource's worker.
    pub async fn enqueue(
        &self,
        path: ResourcePath,
        payload: Vec<u8>,
        origin: SyncOrigin,
    ) -> Result<SyncEvent, SyncError> {
        let base = self.inner.store.version(&path);
        let event = SyncEvent::new(path, base, payload, origin);
        self.enqueue_event(event).await
    }

    /// Like [`enqueue`](Self::enqueue), restricted to a subset of targets.
    pub async fn enqueue_selected(
        &self,
        path: ResourcePath,
        payload: Vec<u8>,
        origin: SyncOrigin,
        targets: Option<Vec<TargetId>>,
    ) -> Result<SyncEvent, SyncError> {
        let base = self.inner.store.version(&path);
        let event = SyncEvent::new(path, base, payload, origin);
        self.submit(QueuedEvent {
            event: event.clone(),
            targets,
        })
        .await?;
        Ok(event)
    }

    /// Enqueue a pre-built event (restore, replayed remote proposals).
    pub async fn enqueue_event(&self, event: SyncEvent) -> Result<SyncEvent, SyncError> {
        self.submit(QueuedEvent {
            event: event.clone(),
            targets: None,
        })
        .await?;
        Ok(event)
    }

    async fn submit(&self, queued: QueuedEvent) -> Result<(), SyncError> {
        let sender = self.worker_for(&queued.event.resource_path).await;
        self.inner.inflight.fetch_add(1, Ordering::SeqCst);
        if sender.send(queued).await.is_err() {
            self.inner.inflight.fetch_sub(1, Ordering::SeqCst);
            return Err(SyncError::ChannelClosed("sync worker"));
        }
        Ok(())
    }

    /// Build and enqueue a restore event for an old version.
    pub async fn restore(
        &self,
        path: &ResourcePath,
        version: u64,
    ) -> Result<SyncEvent, SyncError> {
        let event = self.inner.store.restore(path, version)?;
        self.enqueue_event(event).await
    }

    /// Settle a pending conflict manually. `RemoteWins` re-applies the
    /// preserved remote payload through the normal pipeline.
    pub async fn resolve_conflict(
        &self,
        path: &ResourcePath,
        choice: Resolution,
    ) -> Result<ConflictRecord, SyncError> {
        let (record, payload) = self.inner.resolver.resolve_pending(path, choice)?;
        if let Some(payload) = payload {
            self.enqueue(path.clone(), payload, SyncOrigin::Api).await?;
        }
        Ok(record)
    }

    /// Current head version of a resource (0 if unknown).
    pub fn version(&self, path: &ResourcePath) -> u64 {
        self.inner.store.version(path)
    }

    /// Current head state of a resource.
    pub fn resource(&self, path: &ResourcePath) -> Option<MirroredResource> {
        self.inner.store.resource(path)
    }

    /// Unresolved conflicts.
    pub fn list_conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.resolver.pending()
    }

    /// Full resolution audit log.
    pub fn conflict_records(&self) -> Vec<ConflictRecord> {
        self.inner.resolver.records()
    }

    /// Snapshot of every target with its current health.
    pub async fn targets(&self) -> Vec<MirrorTarget> {
        let targets = self.inner.targets.read().await;
        let mut all: Vec<MirrorTarget> = targets.values().map(|rt| rt.target.clone()).collect();
        all.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        all
    }

    pub async fn target_health(&self, id: &TargetId) -> Result<TargetHealth, SyncError> {
        let targets = self.inner.targets.read().await;
        targets
            .get(id)
            .map(|rt| rt.target.health)
            .ok_or_else(|| SyncError::UnknownTarget { id: id.clone() })
    }

    /// Number of parked writes for a target.
    pub async fn parked_count(&self, id: &TargetId) -> Result<usize, SyncError> {
        let targets = self.inner.targets.read().await;
        targets
            .get(id)
            .map(|rt| rt.parked.len())
            .ok_or_else(|| SyncError::UnknownTarget { id: id.clone() })
    }

    /// Run the heartbeat loop until `shutdown` fires.
    pub async fn run_heartbeat(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // consume the immediate tick
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => self.heartbeat_round().await,
            }
        }
    }

    /// One heartbeat pass over every target. Public so tests and the engine
    /// can drive rounds deterministically.
    pub async fn heartbeat_round(&self) {
        let snapshot: Vec<(TargetId, Arc<dyn MirrorBackend>)> = {
            let targets = self.inner.targets.read().await;
            targets
                .values()
                .map(|rt| (rt.target.id.clone(), rt.backend.clone()))
                .collect()
        };

        for (id, backend) in snapshot {
            let reply =
                tokio::time::timeout(self.inner.options.heartbeat_timeout, backend.health()).await;
            match reply {
                Ok(Ok(())) => self.on_heartbeat_ok(&id).await,
                Ok(Err(err)) => {
                    tracing::warn!("heartbeat for target {} failed: {}", id, err);
                    self.record_failure(&id).await;
                }
                Err(_) => {
                    tracing::warn!("heartbeat for target {} timed out", id);
                    self.record_failure(&id).await;
                }
            }
        }
    }

    /// Wait until every enqueued event has been processed, up to `grace`.
    /// Returns false when events were still in flight at the deadline.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.inner.inflight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    // -- internals ---------------------------------------------------------

    async fn worker_for(&self, path: &ResourcePath) -> mpsc::Sender<QueuedEvent> {
        let mut workers = self.inner.workers.lock().await;
        if let Some(tx) = workers.get(path) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, mut rx) = mpsc::channel::<QueuedEvent>(64);
        workers.insert(path.clone(), tx.clone());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                process_event(&inner, queued).await;
                inner.inflight.fetch_sub(1, Ordering::SeqCst);
            }
        });
        tx
    }

    async fn on_heartbeat_ok(&self, id: &TargetId) {
        let previous = {
            let mut targets = self.inner.targets.write().await;
            let Some(rt) = targets.get_mut(id) else { return };
            rt.failures = 0;
            let previous = rt.target.health;
            if previous == TargetHealth::Degraded {
                rt.target.health = TargetHealth::Online;
            }
            previous
        };

        match previous {
            TargetHealth::Degraded => {
                notify(
                    &self.inner,
                    SyncOutcome::TargetHealth {
                        id: id.clone(),
                        health: TargetHealth::Online,
                    },
                )
                .await;
            }
            TargetHealth::Offline => self.replay_parked(id).await,
            TargetHealth::Online => {}
        }
    }

    /// Replay a recovered target's parked writes in original order; the
    /// target only returns Online once its backlog is empty.
    async fn replay_parked(&self, id: &TargetId) {
        let backend = {
            let targets = self.inner.targets.read().await;
            let Some(rt) = targets.get(id) else { return };
            rt.backend.clone()
        };

        let mut replayed = 0usize;
        loop {
            let next = {
                let targets = self.inner.targets.read().await;
                targets.get(id).and_then(|rt| rt.parked.front().cloned())
            };
            let Some(write) = next else { break };

            let already = {
                let targets = self.inner.targets.read().await;
                targets
                    .get(id)
                    .map(|rt| rt.delivered.get(&write.path) == Some(&write.content_hash))
                    .unwrap_or(false)
            };
            if !already {
                if deliver_with_retry(backend.as_ref(), id, &write.path, &write.bytes)
                    .await
                    .is_err()
                {
                    // Still unreachable: stay Offline, keep the backlog.
                    return;
                }
            }

            let mut targets = self.inner.targets.write().await;
            if let Some(rt) = targets.get_mut(id) {
                rt.parked.pop_front();
                rt.delivered.insert(write.path.clone(), write.content_hash);
                rt.target.last_sync_at = Some(Utc::now());
            }
            replayed += 1;
        }

        {
            let mut targets = self.inner.targets.write().await;
            if let Some(rt) = targets.get_mut(id) {
                rt.failures = 0;
                rt.target.health = TargetHealth::Online;
            }
        }
        tracing::info!("target {} back online, {} writes replayed", id, replayed);
        notify(
            &self.inner,
            SyncOutcome::Replayed {
                id: id.clone(),
                replayed,
            },
        )
        .await;
        notify(
            &self.inner,
            SyncOutcome::TargetHealth {
                id: id.clone(),
                health: TargetHealth::Online,
            },
        )
        .await;
    }

    async fn record_failure(&self, id: &TargetId) {
        record_failure_inner(&self.inner, id).await;
    }
}

/// Process one event on its resource's worker.
async fn process_event(inner: &Arc<Inner>, queued: QueuedEvent) {
    let QueuedEvent { event, targets } = queued;
    let selection = targets.as_deref();
    let path = event.resource_path.clone();
    let payload_hash = content_hash(&event.payload);
    let current = inner.store.resource(&path);

    // Idempotent fast-forward: the payload already is the head content.
    if let Some(cur) = &current {
        if cur.content_hash == payload_hash {
            notify(
                inner,
                SyncOutcome::FastForward {
                    path,
                    version: cur.version,
                },
            )
            .await;
            return;
        }
    }

    let current_version = current.as_ref().map(|c| c.version).unwrap_or(0);
    if event.base_version == current_version {
        if let Err(err) =
            apply_new_version(inner, &path, &event.payload, event.origin, selection).await
        {
            tracing::error!("failed to apply event for {}: {}", path, err);
        }
        return;
    }

    // Stale base: route through the conflict resolver.
    let ancestor = if event.base_version == 0 {
        Vec::new()
    } else {
        inner
            .store
            .content(&path, event.base_version)
            .unwrap_or_default()
    };
    let local = inner
        .store
        .content(&path, current_version)
        .unwrap_or_default();
    let policy = ConflictResolver::default_policy(&event.payload);
    let outcome = inner.resolver.resolve(
        &path,
        current_version,
        event.proposed_version,
        &ancestor,
        &local,
        &event.payload,
        policy,
    );

    tracing::info!(
        "conflict on {} (local v{}, remote v{}): {:?}",
        path,
        current_version,
        event.proposed_version,
        outcome.record.resolution,
    );
    notify(
        inner,
        SyncOutcome::Conflicted {
            record: outcome.record,
        },
    )
    .await;

    if let Some(payload) = outcome.merged_payload {
        if let Err(err) =
            apply_new_version(inner, &path, &payload, event.origin, selection).await
        {
            tracing::error!("failed to apply resolved content for {}: {}", path, err);
        }
    }
}

async fn apply_new_version(
    inner: &Arc<Inner>,
    path: &ResourcePath,
    payload: &[u8],
    origin: SyncOrigin,
    selection: Option<&[TargetId]>,
) -> Result<(), SyncError> {
    let version = inner.store.version(path) + 1;
    let writer = origin_label(origin);
    inner.store.snapshot(path, version, payload, writer)?;

    let resource = inner
        .store
        .resource(path)
        .ok_or_else(|| SyncError::UnknownResource { path: path.clone() })?;

    fan_out(inner, path, payload, selection).await;

    // Retention, sparing versions referenced by unresolved conflicts.
    let protected = inner.resolver.protected_versions(path);
    match inner
        .store
        .prune(path, inner.options.retention_keep, &protected)
    {
        Ok(0) => {}
        Ok(removed) => tracing::debug!("pruned {} old versions of {}", removed, path),
        Err(err) => tracing::warn!("retention prune for {} failed: {}", path, err),
    }

    notify(inner, SyncOutcome::Applied { resource, origin }).await;
    Ok(())
}

/// Deliver one applied write to every selected (default: every) target.
async fn fan_out(
    inner: &Arc<Inner>,
    path: &ResourcePath,
    payload: &[u8],
    selection: Option<&[TargetId]>,
) {
    let hash = content_hash(payload);
    let snapshot: Vec<(TargetId, Arc<dyn MirrorBackend>, TargetHealth, bool)> = {
        let targets = inner.targets.read().await;
        targets
            .values()
            .filter(|rt| {
                selection
                    .map(|ids| ids.contains(&rt.target.id))
                    .unwrap_or(true)
            })
            .map(|rt| {
                (
                    rt.target.id.clone(),
                    rt.backend.clone(),
                    rt.target.health,
                    rt.delivered.get(path) == Some(&hash),
                )
            })
            .collect()
    };

    for (id, backend, health, already_delivered) in snapshot {
        if health == TargetHealth::Offline {
            park(inner, &id, path, payload, &hash).await;
            continue;
        }
        if already_delivered {
            continue;
        }

        match deliver_with_retry(backend.as_ref(), &id, path, payload).await {
            Ok(()) => {
                let recovered = {
                    let mut targets = inner.targets.write().await;
                    let Some(rt) = targets.get_mut(&id) else { continue };
                    rt.delivered.insert(path.clone(), hash.clone());
                    rt.failures = 0;
                    rt.target.last_sync_at = Some(Utc::now());
                    if rt.target.health == TargetHealth::Degraded {
                        rt.target.health = TargetHealth::Online;
                        true
                    } else {
                        false
                    }
                };
                if recovered {
                    notify(
                        inner,
                        SyncOutcome::TargetHealth {
                            id: id.clone(),
                            health: TargetHealth::Online,
                        },
                    )
                    .await;
                }
            }
            Err(_) => {
                park(inner, &id, path, payload, &hash).await;
                record_failure_inner(inner, &id).await;
            }
        }
    }
}

async fn park(inner: &Arc<Inner>, id: &TargetId, path: &ResourcePath, bytes: &[u8], hash: &str) {
    {
        let mut targets = inner.targets.write().await;
        let Some(rt) = targets.get_mut(id) else { return };
        rt.parked.push_back(ParkedWrite {
            path: path.clone(),
            bytes: bytes.to_vec(),
            content_hash: hash.to_string(),
        });
    }
    notify(
        inner,
        SyncOutcome::Parked {
            id: id.clone(),
            path: path.clone(),
        },
    )
    .await;
}

async fn record_failure_inner(inner: &Arc<Inner>, id: &TargetId) {
    let change = {
        let mut targets = inner.targets.write().await;
        let Some(rt) = targets.get_mut(id) else { return };
        rt.failures += 1;
        let new_health = if rt.failures >= OFFLINE_AFTER {
            TargetHealth::Offline
        } else {
            TargetHealth::Degraded
        };
        if rt.target.health != new_health {
            rt.target.health = new_health;
            Some(new_health)
        } else {
            None
        }
    };

    if let Some(health) = change {
        tracing::warn!("target {} is now {}", id, health);
        notify(inner, SyncOutcome::TargetHealth { id: id.clone(), health }).await;
    }
}

async fn deliver_with_retry(
    backend: &dyn MirrorBackend,
    id: &TargetId,
    path: &ResourcePath,
    bytes: &[u8],
) -> Result<(), SyncError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match backend.write(path, bytes).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if attempt >= DELIVERY_ATTEMPTS {
                    tracing::warn!(
                        "delivery to target {} failed after {} attempts: {}",
                        id,
                        attempt,
                        err,
                    );
                    return Err(SyncError::TargetUnreachable { id: id.clone() });
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

async fn notify(inner: &Arc<Inner>, outcome: SyncOutcome) {
    // The engine's pump owns the receiving end; a closed channel only
    // happens during shutdown.
    let _ = inner.outcome_tx.send(outcome).await;
}

fn origin_label(origin: SyncOrigin) -> &'static str {
    match origin {
        SyncOrigin::Command => "command",
        SyncOrigin::Api => "api",
        SyncOrigin::Restore => "restore",
        SyncOrigin::Replay => "replay",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
