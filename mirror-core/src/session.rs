//! Session registry — the authoritative state machine for command
//! executions.
//!
//! # State graph
//!
//! ```text
//! Pending ──▶ Running ──▶ Streaming ──▶ Completed
//!                              └──────▶ Failed
//! (any non-terminal) ──▶ Cancelled
//! ```
//!
//! The registry is an explicitly constructed service object; callers inject
//! it wherever session state is needed, and tests build isolated instances.
//! Grace-period bookkeeping for cancellation lives in the caller: the
//! registry only records the request and performs the eventual
//! `force_cancel`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::error::SessionError;
use crate::types::{Session, SessionId, SessionState};

/// Note attached to sessions force-cancelled after the adapter ignored a
/// cooperative cancel for the full grace period.
pub const TIMEOUT_ON_CANCEL: &str = "TimeoutOnCancel";

/// Authoritative owner of all [`Session`] records.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session in `Pending`.
    ///
    /// Fails with [`SessionError::InvalidWorkingDirectory`] unless
    /// `working_dir` is an accessible directory.
    pub fn create_session(
        &self,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        owner: impl Into<String>,
    ) -> Result<Session, SessionError> {
        let working_dir = working_dir.into();
        validate_working_dir(&working_dir)?;

        let session = Session {
            id: SessionId::generate(),
            command: command.into(),
            working_dir,
            state: SessionState::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            owner: owner.into(),
            cancel_requested: false,
            note: None,
        };

        let mut sessions = self.lock();
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Read-only snapshot of one session.
    pub fn get(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession { id: id.clone() })
    }

    /// Read-only snapshot of every session, sorted by creation time.
    pub fn list(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.lock().values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Move a session to `new_state`, enforcing the legal transition graph.
    ///
    /// Illegal transitions fail with [`SessionError::InvalidStateTransition`]
    /// and leave the session untouched. Entering `Running` stamps
    /// `started_at`; entering a terminal state stamps `ended_at`.
    pub fn transition(
        &self,
        id: &SessionId,
        new_state: SessionState,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession { id: id.clone() })?;

        if !is_legal_transition(session.state, new_state) {
            return Err(SessionError::InvalidStateTransition {
                id: id.clone(),
                from: session.state,
                to: new_state,
            });
        }

        apply_transition(session, new_state);
        Ok(session.clone())
    }

    /// Finish a streaming session with the adapter's exit code:
    /// 0 → `Completed`, anything else → `Failed`.
    pub fn finish(&self, id: &SessionId, exit_code: i32) -> Result<Session, SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession { id: id.clone() })?;

        let new_state = if exit_code == 0 {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        if !is_legal_transition(session.state, new_state) {
            return Err(SessionError::InvalidStateTransition {
                id: id.clone(),
                from: session.state,
                to: new_state,
            });
        }

        session.exit_code = Some(exit_code);
        apply_transition(session, new_state);
        Ok(session.clone())
    }

    /// Record a cooperative cancellation request.
    ///
    /// Returns the session snapshot so the caller can decide whether a
    /// signal to the adapter is still worthwhile. Requests against terminal
    /// sessions are ignored.
    pub fn request_cancel(&self, id: &SessionId) -> Result<Session, SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession { id: id.clone() })?;
        if !session.state.is_terminal() {
            session.cancel_requested = true;
        }
        Ok(session.clone())
    }

    /// Force a non-terminal session into `Cancelled`, attaching `note`
    /// (typically [`TIMEOUT_ON_CANCEL`]). No-op on terminal sessions.
    pub fn force_cancel(&self, id: &SessionId, note: &str) -> Result<Session, SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession { id: id.clone() })?;
        if !session.state.is_terminal() {
            session.note = Some(note.to_string());
            apply_transition(session, SessionState::Cancelled);
        }
        Ok(session.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Session>> {
        // A poisoned lock means a panic mid-update; the map itself is still
        // structurally sound, so recover the guard.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_working_dir(path: &Path) -> Result<(), SessionError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(SessionError::InvalidWorkingDirectory {
            path: path.to_path_buf(),
        }),
    }
}

/// The full legal transition graph.
fn is_legal_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        (Pending, Running) => true,
        (Running, Streaming) => true,
        (Streaming, Completed) | (Streaming, Failed) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

fn apply_transition(session: &mut Session, new_state: SessionState) {
    let now = Utc::now();
    if new_state == SessionState::Running {
        session.started_at = Some(now);
    }
    if new_state.is_terminal() {
        session.ended_at = Some(now);
    }
    session.state = new_state;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
