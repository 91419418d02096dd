//! Platform command adapter seam.
//!
//! The engine consumes commands through [`CommandAdapter`] /
//! [`CommandHandle`] only; no OS-specific logic leaks above this module.
//! [`ProcessAdapter`] is the default local implementation over
//! `tokio::process`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use mirror_core::StreamKind;

use crate::error::AdapterError;

/// Signal kinds the engine may deliver to a running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Cooperative cancellation (SIGINT on unix).
    Interrupt,
    /// Forced termination.
    Kill,
}

/// One slice of raw output read from the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterChunk {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

/// Handle to one running command.
#[async_trait]
pub trait CommandHandle: Send {
    /// Next slice of output from either stream; `None` once both streams
    /// reached EOF.
    async fn read_chunk(&mut self) -> Result<Option<AdapterChunk>, AdapterError>;

    /// Deliver a signal. Delivery to an already-exited process is a no-op.
    async fn signal(&mut self, kind: SignalKind) -> Result<(), AdapterError>;

    /// Wait for the process and return its exit code.
    async fn wait(&mut self) -> Result<i32, AdapterError>;
}

/// Starts commands and hands back opaque handles.
#[async_trait]
pub trait CommandAdapter: Send + Sync {
    async fn start(
        &self,
        command: &str,
        working_dir: &Path,
    ) -> Result<Box<dyn CommandHandle>, AdapterError>;
}

// ---------------------------------------------------------------------------
// ProcessAdapter
// ---------------------------------------------------------------------------

/// Local implementation: commands run through the platform shell with piped
/// stdout/stderr and no stdin.
#[derive(Debug, Default, Clone)]
pub struct ProcessAdapter;

impl ProcessAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandAdapter for ProcessAdapter {
    async fn start(
        &self,
        command: &str,
        working_dir: &Path,
    ) -> Result<Box<dyn CommandHandle>, AdapterError> {
        let mut child = shell_command(command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AdapterError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Ok(Box::new(ProcessHandle {
            child,
            stdout,
            stderr,
        }))
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

struct ProcessHandle {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Read into `buf`, or never resolve when the stream is already closed.
/// Lets `select!` race both streams without re-checking which are live.
async fn read_or_pending<R: AsyncRead + Unpin>(
    reader: Option<&mut R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl CommandHandle for ProcessHandle {
    async fn read_chunk(&mut self) -> Result<Option<AdapterChunk>, AdapterError> {
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];

        loop {
            if self.stdout.is_none() && self.stderr.is_none() {
                return Ok(None);
            }

            tokio::select! {
                res = read_or_pending(self.stdout.as_mut(), &mut out_buf) => match res? {
                    0 => self.stdout = None,
                    n => {
                        return Ok(Some(AdapterChunk {
                            stream: StreamKind::Stdout,
                            bytes: out_buf[..n].to_vec(),
                        }))
                    }
                },
                res = read_or_pending(self.stderr.as_mut(), &mut err_buf) => match res? {
                    0 => self.stderr = None,
                    n => {
                        return Ok(Some(AdapterChunk {
                            stream: StreamKind::Stderr,
                            bytes: err_buf[..n].to_vec(),
                        }))
                    }
                },
            }
        }
    }

    async fn signal(&mut self, kind: SignalKind) -> Result<(), AdapterError> {
        match kind {
            SignalKind::Interrupt => interrupt(&self.child),
            SignalKind::Kill => match self.child.start_kill() {
                Ok(()) => Ok(()),
                // InvalidInput: the child has already exited.
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(AdapterError::Io(e)),
            },
        }
    }

    async fn wait(&mut self) -> Result<i32, AdapterError> {
        let status = self.child.wait().await?;
        // Signal-terminated processes have no code; report -1.
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) -> Result<(), AdapterError> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: plain kill(2) on a pid we own; no memory is touched.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(AdapterError::Io(std::io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> Result<(), AdapterError> {
    // No SIGINT equivalent; callers fall through to Kill after the grace.
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(handle: &mut Box<dyn CommandHandle>) -> Vec<AdapterChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = handle.read_chunk().await.expect("read") {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn echo_produces_stdout_and_exit_zero() {
        let adapter = ProcessAdapter::new();
        let cwd = std::env::temp_dir();
        let mut handle = adapter.start("echo hi", &cwd).await.expect("start");

        let chunks = drain(&mut handle).await;
        let stdout: Vec<u8> = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stdout)
            .flat_map(|c| c.bytes.clone())
            .collect();
        assert_eq!(stdout, b"hi\n");
        assert_eq!(handle.wait().await.expect("wait"), 0);
    }

    #[tokio::test]
    async fn stderr_is_tagged_separately() {
        let adapter = ProcessAdapter::new();
        let cwd = std::env::temp_dir();
        let mut handle = adapter
            .start("echo oops 1>&2", &cwd)
            .await
            .expect("start");

        let chunks = drain(&mut handle).await;
        assert!(chunks.iter().any(|c| c.stream == StreamKind::Stderr));
        assert!(chunks.iter().all(|c| c.stream != StreamKind::Stdout));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_propagated() {
        let adapter = ProcessAdapter::new();
        let cwd = std::env::temp_dir();
        let mut handle = adapter.start("exit 3", &cwd).await.expect("start");
        drain(&mut handle).await;
        assert_eq!(handle.wait().await.expect("wait"), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_a_long_sleep() {
        let adapter = ProcessAdapter::new();
        let cwd = std::env::temp_dir();
        let mut handle = adapter.start("sleep 60", &cwd).await.expect("start");
        handle.signal(SignalKind::Kill).await.expect("kill");
        let code = handle.wait().await.expect("wait");
        assert_ne!(code, 0);
    }
}
