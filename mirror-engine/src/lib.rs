//! # mirror-engine
//!
//! The facade crate: owns configuration and lifecycle, wires the session
//! registry, result capture, sync manager, and broadcast layer together,
//! and exposes the public API.
//!
//! ```no_run
//! use mirror_core::MirrorConfig;
//! use mirror_engine::MirrorEngine;
//!
//! # async fn demo() -> Result<(), mirror_engine::EngineError> {
//! let engine = MirrorEngine::start(MirrorConfig::rooted_at("/tmp/mirror")).await?;
//! let handle = engine
//!     .execute_and_mirror("echo hi", "/tmp", "demo", None)
//!     .await?;
//! let session = handle.wait().await?;
//! assert_eq!(session.exit_code, Some(0));
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;

pub use engine::{ExecutionHandle, MirrorEngine, ENGINE_STOPPED_NOTE, IDLE_TIMEOUT_NOTE};
pub use error::EngineError;

/// Install the default tracing subscriber (env-filtered, like
/// `RUST_LOG=info`). Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
