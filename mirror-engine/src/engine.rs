//! Mirror engine facade — configuration, lifecycle, and the public API.
//!
//! `start` validates everything up front (listing every violation), wires
//! registry → capture → sync → transport, and spawns the background loops:
//! target heartbeat, outcome pump, and subscription sweeper.
//! `execute_and_mirror` is non-blocking: it chains session creation →
//! adapter start → capture loop → sync enqueue and returns a handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use mirror_capture::{
    AdapterChunk, CommandAdapter, ProcessAdapter, RenderFormat, ResultCapture, SignalKind,
};
use mirror_core::{
    ChunkKind, ConflictRecord, MirrorConfig, MirrorTarget, MirroredResource, OutputChunk,
    Resolution, ResourcePath, Session, SessionId, SessionRegistry, SessionState, StreamKind,
    SyncEvent, SyncOrigin, TargetId, TargetKind, ViewerId, TIMEOUT_ON_CANCEL,
};
use mirror_sync::{
    ConflictResolver, LocalDirBackend, MirrorBackend, SyncManager, SyncOptions, SyncOutcome,
    VersionEntry, VersionStore,
};
use mirror_transport::{Broadcaster, Envelope, SubscriptionFilter, ViewerPayload};

use crate::error::EngineError;

/// Note attached to sessions force-cancelled for producing no output within
/// `command_timeout`.
pub const IDLE_TIMEOUT_NOTE: &str = "IdleTimeout";
/// Note attached to sessions force-cancelled by `stop()`.
pub const ENGINE_STOPPED_NOTE: &str = "EngineStopped";

struct Shared {
    registry: SessionRegistry,
    capture: ResultCapture,
    manager: SyncManager,
    store: Arc<VersionStore>,
    broadcaster: Broadcaster,
    adapter: Arc<dyn CommandAdapter>,
    cancels: StdMutex<HashMap<SessionId, Arc<Notify>>>,
    command_timeout: Duration,
    cancel_grace: Duration,
}

/// Handle returned by [`MirrorEngine::execute_and_mirror`].
pub struct ExecutionHandle {
    pub session_id: SessionId,
    done: oneshot::Receiver<Session>,
}

impl ExecutionHandle {
    /// Await the session's terminal state.
    pub async fn wait(self) -> Result<Session, EngineError> {
        self.done
            .await
            .map_err(|_| EngineError::ChannelClosed("session task"))
    }
}

/// The engine. One instance per configuration; no global state anywhere.
pub struct MirrorEngine {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    background: StdMutex<Vec<JoinHandle<()>>>,
    drain_grace: Duration,
}

impl std::fmt::Debug for MirrorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorEngine")
            .field("drain_grace", &self.drain_grace)
            .finish_non_exhaustive()
    }
}

impl MirrorEngine {
    /// Start with the default process adapter and in-tree backends.
    pub async fn start(config: MirrorConfig) -> Result<Self, EngineError> {
        Self::start_with(config, Arc::new(ProcessAdapter::new()), HashMap::new()).await
    }

    /// Start with a custom adapter and/or externally supplied backends for
    /// non-local target kinds.
    ///
    /// Fails fast with [`EngineError::Configuration`] listing **all**
    /// violations, including targets that have no usable backend.
    pub async fn start_with(
        config: MirrorConfig,
        adapter: Arc<dyn CommandAdapter>,
        extra_backends: HashMap<TargetId, Arc<dyn MirrorBackend>>,
    ) -> Result<Self, EngineError> {
        let mut violations = config.validate();

        let mut backends = extra_backends;
        for target in &config.targets {
            if backends.contains_key(&target.id) {
                continue;
            }
            match target.kind {
                TargetKind::LocalDir => {
                    backends.insert(
                        target.id.clone(),
                        Arc::new(LocalDirBackend::new(PathBuf::from(&target.address))),
                    );
                }
                kind => violations.push(format!(
                    "target '{}' ({kind}) has no backend registered",
                    target.id
                )),
            }
        }
        if !violations.is_empty() {
            return Err(EngineError::Configuration { violations });
        }

        let store = Arc::new(VersionStore::open(&config.root)?);
        let resolver = Arc::new(ConflictResolver::new());
        let (outcome_tx, outcome_rx) = mpsc::channel::<SyncOutcome>(256);
        let manager = SyncManager::new(
            store.clone(),
            resolver,
            outcome_tx,
            SyncOptions {
                heartbeat_timeout: config.heartbeat_timeout(),
                retention_keep: config.retention.max_versions,
            },
        );

        for target in &config.targets {
            let Some(backend) = backends.get(&target.id) else {
                continue;
            };
            manager
                .add_target(
                    MirrorTarget {
                        id: target.id.clone(),
                        kind: target.kind,
                        address: target.address.clone(),
                        last_sync_at: None,
                        health: Default::default(),
                    },
                    backend.clone(),
                )
                .await;
        }

        let shared = Arc::new(Shared {
            registry: SessionRegistry::new(),
            capture: ResultCapture::new(config.ring_buffer_chunks),
            manager: manager.clone(),
            store,
            broadcaster: Broadcaster::new(config.viewer_grace()),
            adapter,
            cancels: StdMutex::new(HashMap::new()),
            command_timeout: config.command_timeout(),
            cancel_grace: config.cancel_grace(),
        });

        let (shutdown_tx, _) = broadcast::channel::<()>(8);
        let mut background = Vec::new();

        background.push({
            let manager = manager.clone();
            let interval = config.heartbeat_interval();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                manager.run_heartbeat(interval, shutdown).await;
            })
        });

        background.push({
            let shared = shared.clone();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                outcome_pump(shared, outcome_rx, shutdown).await;
            })
        });

        background.push({
            let shared = shared.clone();
            let interval = config.viewer_grace();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                shared.broadcaster.run_sweeper(interval, shutdown).await;
            })
        });

        Ok(Self {
            shared,
            shutdown_tx,
            background: StdMutex::new(background),
            drain_grace: config.drain_grace(),
        })
    }

    // -- sessions ----------------------------------------------------------

    /// Create a session in `Pending` without executing it.
    pub fn create_session(
        &self,
        command: &str,
        working_dir: impl Into<PathBuf>,
        owner: &str,
    ) -> Result<Session, EngineError> {
        Ok(self.shared.registry.create_session(command, working_dir, owner)?)
    }

    /// Execute a command and mirror its output. Non-blocking: the capture
    /// loop runs on its own task; the returned handle can be awaited for
    /// the terminal session state.
    ///
    /// `target_selection` restricts which targets receive the persisted
    /// output (`None` = all).
    pub async fn execute_and_mirror(
        &self,
        command: &str,
        working_dir: impl Into<PathBuf>,
        owner: &str,
        target_selection: Option<Vec<TargetId>>,
    ) -> Result<ExecutionHandle, EngineError> {
        let session = self.shared.registry.create_session(command, working_dir, owner)?;
        let session_id = session.id.clone();

        let cancel = Arc::new(Notify::new());
        self.lock_cancels()
            .insert(session_id.clone(), cancel.clone());

        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_session(shared, session, cancel, done_tx, target_selection).await;
        });

        Ok(ExecutionHandle {
            session_id,
            done: done_rx,
        })
    }

    /// Request cooperative cancellation. If the command ignores the signal
    /// for the configured grace period it is killed and the session is
    /// force-cancelled with a [`TIMEOUT_ON_CANCEL`] note.
    pub async fn cancel_session(&self, id: &SessionId) -> Result<Session, EngineError> {
        let session = self.shared.registry.request_cancel(id)?;
        let notify = self.lock_cancels().get(id).cloned();
        match notify {
            Some(notify) => notify.notify_one(),
            // Never executed (or already finished): settle directly.
            None if !session.state.is_terminal() => {
                self.shared.registry.transition(id, SessionState::Cancelled)?;
            }
            None => {}
        }
        Ok(self.shared.registry.get(id)?)
    }

    pub fn get_session_status(&self, id: &SessionId) -> Result<Session, EngineError> {
        Ok(self.shared.registry.get(id)?)
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.shared.registry.list()
    }

    /// Render a session's captured output.
    pub fn render_output(
        &self,
        id: &SessionId,
        format: RenderFormat,
    ) -> Result<String, EngineError> {
        Ok(self.shared.capture.render(id, format)?)
    }

    /// Buffered chunks for a viewer's gap backfill.
    pub fn backfill_chunks(
        &self,
        id: &SessionId,
        stream: StreamKind,
        from_seq: u64,
    ) -> Result<Vec<OutputChunk>, EngineError> {
        Ok(self.shared.capture.chunks_from(id, stream, from_seq)?)
    }

    // -- resources ---------------------------------------------------------

    /// Propose new content for a resource through the sync pipeline.
    pub async fn enqueue_sync(
        &self,
        path: ResourcePath,
        content: Vec<u8>,
    ) -> Result<SyncEvent, EngineError> {
        Ok(self
            .shared
            .manager
            .enqueue(path, content, SyncOrigin::Api)
            .await?)
    }

    pub fn get_resource_version(&self, path: &ResourcePath) -> u64 {
        self.shared.manager.version(path)
    }

    pub fn get_resource(&self, path: &ResourcePath) -> Option<MirroredResource> {
        self.shared.manager.resource(path)
    }

    /// Version history, newest first.
    pub fn history(&self, path: &ResourcePath, limit: usize) -> Vec<VersionEntry> {
        self.shared.store.history(path, limit)
    }

    /// Re-apply an old version as a new sync event.
    pub async fn restore(
        &self,
        path: &ResourcePath,
        version: u64,
    ) -> Result<SyncEvent, EngineError> {
        Ok(self.shared.manager.restore(path, version).await?)
    }

    pub fn list_conflicts(&self) -> Vec<ConflictRecord> {
        self.shared.manager.list_conflicts()
    }

    pub async fn resolve_conflict(
        &self,
        path: &ResourcePath,
        choice: Resolution,
    ) -> Result<ConflictRecord, EngineError> {
        Ok(self.shared.manager.resolve_conflict(path, choice).await?)
    }

    pub async fn targets(&self) -> Vec<MirrorTarget> {
        self.shared.manager.targets().await
    }

    // -- viewers -----------------------------------------------------------

    pub fn subscribe(
        &self,
        viewer_id: ViewerId,
        filter: SubscriptionFilter,
    ) -> mpsc::Receiver<Envelope> {
        self.shared.broadcaster.subscribe(viewer_id, filter)
    }

    pub fn reconnect(
        &self,
        viewer_id: &ViewerId,
    ) -> Result<mpsc::Receiver<Envelope>, EngineError> {
        Ok(self.shared.broadcaster.reconnect(viewer_id)?)
    }

    pub fn unsubscribe(&self, viewer_id: &ViewerId) {
        self.shared.broadcaster.unsubscribe(viewer_id);
    }

    // -- lifecycle ---------------------------------------------------------

    /// Drain in-flight sync events for the configured grace period, then
    /// force-cancel remaining sessions and stop the background loops.
    pub async fn stop(self) -> Result<(), EngineError> {
        if !self.shared.manager.drain(self.drain_grace).await {
            tracing::warn!("drain grace expired with sync events still in flight");
        }

        for session in self.shared.registry.list() {
            if session.state.is_terminal() {
                continue;
            }
            let _ = self.shared.registry.request_cancel(&session.id);
            let _ = self
                .shared
                .registry
                .force_cancel(&session.id, ENGINE_STOPPED_NOTE);
            if let Some(notify) = self.lock_cancels().get(&session.id).cloned() {
                notify.notify_one();
            }
        }

        let _ = self.shutdown_tx.send(());
        let background = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in background {
            let _ = handle.await;
        }
        Ok(())
    }

    fn lock_cancels(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<Notify>>> {
        self.shared.cancels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Pump sync outcomes into the broadcast layer.
async fn outcome_pump(
    shared: Arc<Shared>,
    mut outcomes: mpsc::Receiver<SyncOutcome>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            outcome = outcomes.recv() => {
                let Some(outcome) = outcome else { break };
                match outcome {
                    SyncOutcome::Applied { resource, origin } => {
                        shared
                            .broadcaster
                            .publish(ViewerPayload::sync_event(resource, origin));
                    }
                    SyncOutcome::Conflicted { record } => {
                        shared.broadcaster.publish(ViewerPayload::conflict(record));
                    }
                    SyncOutcome::TargetHealth { id, health } => {
                        shared
                            .broadcaster
                            .publish(ViewerPayload::target_health(id, health));
                    }
                    SyncOutcome::FastForward { path, version } => {
                        tracing::debug!(resource = %path, version, "fast-forward no-op");
                    }
                    SyncOutcome::Parked { id, path } => {
                        tracing::info!(target = %id, resource = %path, "write parked");
                    }
                    SyncOutcome::Replayed { id, replayed } => {
                        tracing::info!(target = %id, replayed, "parked writes replayed");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

enum SessionEnd {
    /// Streams reached EOF normally.
    Finished,
    /// Cancelled; `note` is set when the forced path was taken.
    Cancelled { note: Option<&'static str> },
}

async fn run_session(
    shared: Arc<Shared>,
    session: Session,
    cancel: Arc<Notify>,
    done_tx: oneshot::Sender<Session>,
    target_selection: Option<Vec<TargetId>>,
) {
    let id = session.id.clone();
    if let Err(err) = drive_session(&shared, &session, cancel, target_selection).await {
        tracing::error!(session = %id, "session task failed: {}", err);
    }
    shared
        .cancels
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);
    let final_state = shared.registry.get(&id).unwrap_or(session);
    let _ = done_tx.send(final_state);
}

async fn drive_session(
    shared: &Arc<Shared>,
    session: &Session,
    cancel: Arc<Notify>,
    target_selection: Option<Vec<TargetId>>,
) -> Result<(), EngineError> {
    let id = &session.id;

    let mut handle = match shared
        .adapter
        .start(&session.command, &session.working_dir)
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            // The command never ran; the session is settled as cancelled
            // with the failure recorded in its note.
            shared.capture.finalize(id, -1);
            let _ = shared
                .registry
                .force_cancel(id, &format!("spawn failed: {err}"));
            return Err(err.into());
        }
    };
    shared.registry.transition(id, SessionState::Running)?;

    let mut streaming = false;
    let end;

    loop {
        tokio::select! {
            _ = cancel.notified() => {
                let _ = handle.signal(SignalKind::Interrupt).await;
                let complied = read_until_eof_or_deadline(
                    shared, id, &mut handle, &mut streaming, shared.cancel_grace,
                ).await;
                if !complied {
                    let _ = handle.signal(SignalKind::Kill).await;
                }
                end = SessionEnd::Cancelled {
                    note: (!complied).then_some(TIMEOUT_ON_CANCEL),
                };
                break;
            }
            read = tokio::time::timeout(shared.command_timeout, handle.read_chunk()) => {
                match read {
                    Err(_) => {
                        // Idle beyond command_timeout: forced cancellation.
                        let _ = handle.signal(SignalKind::Kill).await;
                        end = SessionEnd::Cancelled { note: Some(IDLE_TIMEOUT_NOTE) };
                        break;
                    }
                    Ok(Ok(Some(chunk))) => {
                        ingest_and_publish(shared, id, &mut streaming, chunk);
                    }
                    Ok(Ok(None)) => {
                        end = SessionEnd::Finished;
                        break;
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(session = %id, "adapter read failed: {}", err);
                        end = SessionEnd::Finished;
                        break;
                    }
                }
            }
        }
    }

    let exit_code = handle.wait().await.unwrap_or(-1);
    shared.capture.finalize(id, exit_code);

    match end {
        SessionEnd::Finished => {
            if !streaming {
                // Commands with no output still pass through the (empty)
                // streaming phase.
                let _ = shared.registry.transition(id, SessionState::Streaming);
            }
            let _ = shared.registry.finish(id, exit_code);
        }
        SessionEnd::Cancelled { note: Some(note) } => {
            let _ = shared.registry.force_cancel(id, note);
        }
        SessionEnd::Cancelled { note: None } => {
            let _ = shared.registry.transition(id, SessionState::Cancelled);
        }
    }

    // Captured output is persisted even for cancelled sessions: partial
    // results already captured are never discarded.
    persist_output(shared, id, target_selection).await;
    Ok(())
}

/// Keep draining output after an interrupt; true when the adapter complied
/// (EOF) before the deadline.
async fn read_until_eof_or_deadline(
    shared: &Arc<Shared>,
    id: &SessionId,
    handle: &mut Box<dyn mirror_capture::CommandHandle>,
    streaming: &mut bool,
    grace: Duration,
) -> bool {
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return false,
            read = handle.read_chunk() => match read {
                Ok(Some(chunk)) => ingest_and_publish(shared, id, streaming, chunk),
                _ => return true,
            }
        }
    }
}

fn ingest_and_publish(
    shared: &Arc<Shared>,
    id: &SessionId,
    streaming: &mut bool,
    chunk: AdapterChunk,
) {
    if !*streaming {
        *streaming = true;
        let _ = shared.registry.transition(id, SessionState::Streaming);
    }
    match shared.capture.ingest(id, chunk.stream, chunk.bytes) {
        Ok(emitted) => {
            for chunk in emitted {
                shared.broadcaster.publish(ViewerPayload::chunk(chunk));
            }
        }
        Err(err) => tracing::warn!(session = %id, "ingest failed: {}", err),
    }
}

/// Persist each stream's captured bytes as a mirrored resource at
/// `sessions/<session_id>/<stream>`; the write enters the normal sync
/// pipeline and is subject to the same conflict rules as file mirroring.
async fn persist_output(
    shared: &Arc<Shared>,
    id: &SessionId,
    target_selection: Option<Vec<TargetId>>,
) {
    let Ok(chunks) = shared.capture.chunks(id) else {
        return;
    };
    for stream in [StreamKind::Stdout, StreamKind::Stderr] {
        let bytes: Vec<u8> = chunks
            .iter()
            .filter(|c| c.stream == stream && c.kind == ChunkKind::Data)
            .flat_map(|c| c.bytes.iter().copied())
            .collect();
        if bytes.is_empty() {
            continue;
        }
        let path = ResourcePath::from(format!("sessions/{id}/{stream}"));
        if let Err(err) = shared
            .manager
            .enqueue_selected(path, bytes, SyncOrigin::Command, target_selection.clone())
            .await
        {
            tracing::error!(session = %id, "failed to enqueue captured output: {}", err);
        }
    }
}
