//! Result capture — ordered, bounded buffering of raw command output.
//!
//! Each session owns a ring buffer of [`OutputChunk`]s in arrival order.
//! Sequence numbers are monotonic per (session, stream). On overflow the
//! oldest chunks are evicted and a `Truncated` marker chunk is emitted:
//! freshness over completeness.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;

use mirror_core::{ChunkKind, OutputChunk, SessionId, StreamKind};

use crate::error::CaptureError;
use crate::render::{self, RenderFormat};

#[derive(Debug, Default)]
struct SessionBuffer {
    /// Arrival order, both streams interleaved.
    chunks: VecDeque<OutputChunk>,
    next_stdout_seq: u64,
    next_stderr_seq: u64,
    closed: bool,
    exit_code: Option<i32>,
}

impl SessionBuffer {
    fn take_seq(&mut self, stream: StreamKind) -> u64 {
        let counter = match stream {
            StreamKind::Stdout => &mut self.next_stdout_seq,
            StreamKind::Stderr => &mut self.next_stderr_seq,
        };
        let seq = *counter;
        *counter += 1;
        seq
    }
}

/// Capture service for all sessions of one engine instance.
#[derive(Debug)]
pub struct ResultCapture {
    capacity: usize,
    sessions: Mutex<HashMap<SessionId, SessionBuffer>>,
}

impl ResultCapture {
    /// `capacity` is the per-session ring buffer size in chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one slice of raw output.
    ///
    /// Returns every chunk emitted by this call in order — a `Truncated`
    /// marker first when eviction occurred, then the data chunk — so the
    /// caller can broadcast exactly what was recorded. Fails with
    /// [`CaptureError::SessionClosed`] after `finalize`.
    pub fn ingest(
        &self,
        session_id: &SessionId,
        stream: StreamKind,
        bytes: Vec<u8>,
    ) -> Result<Vec<OutputChunk>, CaptureError> {
        let mut sessions = self.lock();
        let buffer = sessions.entry(session_id.clone()).or_default();
        if buffer.closed {
            return Err(CaptureError::SessionClosed {
                id: session_id.clone(),
            });
        }

        let mut evicted = false;
        while buffer.chunks.len() >= self.capacity {
            buffer.chunks.pop_front();
            evicted = true;
        }
        if evicted {
            tracing::debug!(session = %session_id, %stream, "ring buffer overflow, oldest chunks evicted");
        }

        let mut emitted = Vec::with_capacity(2);
        if evicted {
            let marker = OutputChunk {
                session_id: session_id.clone(),
                sequence: buffer.take_seq(stream),
                timestamp: Utc::now(),
                bytes: Vec::new(),
                stream,
                kind: ChunkKind::Truncated,
            };
            buffer.chunks.push_back(marker.clone());
            emitted.push(marker);
        }

        let chunk = OutputChunk {
            session_id: session_id.clone(),
            sequence: buffer.take_seq(stream),
            timestamp: Utc::now(),
            bytes,
            stream,
            kind: ChunkKind::Data,
        };
        buffer.chunks.push_back(chunk.clone());
        emitted.push(chunk);

        // Capacity 1 cannot hold marker + data; keep the freshest.
        while buffer.chunks.len() > self.capacity {
            buffer.chunks.pop_front();
        }

        Ok(emitted)
    }

    /// Close the stream. Later `ingest` calls fail with `SessionClosed`.
    /// Finalizing a session that never produced output records an empty,
    /// closed buffer.
    pub fn finalize(&self, session_id: &SessionId, exit_code: i32) {
        let mut sessions = self.lock();
        let buffer = sessions.entry(session_id.clone()).or_default();
        buffer.closed = true;
        buffer.exit_code = Some(exit_code);
    }

    /// Exit code recorded at finalize, if any.
    pub fn exit_code(&self, session_id: &SessionId) -> Option<i32> {
        self.lock().get(session_id).and_then(|b| b.exit_code)
    }

    /// Snapshot of all buffered chunks in arrival order.
    pub fn chunks(&self, session_id: &SessionId) -> Result<Vec<OutputChunk>, CaptureError> {
        let sessions = self.lock();
        let buffer = sessions
            .get(session_id)
            .ok_or_else(|| CaptureError::UnknownSession {
                id: session_id.clone(),
            })?;
        Ok(buffer.chunks.iter().cloned().collect())
    }

    /// Buffered chunks of one stream with `sequence >= from_seq`, for viewer
    /// backfill after a detected gap.
    pub fn chunks_from(
        &self,
        session_id: &SessionId,
        stream: StreamKind,
        from_seq: u64,
    ) -> Result<Vec<OutputChunk>, CaptureError> {
        Ok(self
            .chunks(session_id)?
            .into_iter()
            .filter(|c| c.stream == stream && c.sequence >= from_seq)
            .collect())
    }

    /// Render the buffered output.
    ///
    /// Pure over the ingested chunks: repeated calls produce identical
    /// output for identical buffer contents.
    pub fn render(
        &self,
        session_id: &SessionId,
        format: RenderFormat,
    ) -> Result<String, CaptureError> {
        let chunks = self.chunks(session_id)?;
        Ok(render::render_chunks(&chunks, format))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionBuffer>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
