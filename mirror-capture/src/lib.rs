//! # mirror-capture
//!
//! Platform command adapter seam and result capture.
//!
//! [`ResultCapture`] turns raw adapter output into ordered, bounded
//! [`mirror_core::OutputChunk`]s; [`render`] produces renderable text from
//! them without touching the buffers.

pub mod adapter;
pub mod capture;
pub mod error;
pub mod render;

pub use adapter::{AdapterChunk, CommandAdapter, CommandHandle, ProcessAdapter, SignalKind};
pub use capture::ResultCapture;
pub use error::{AdapterError, CaptureError};
pub use render::{render_chunks, RenderFormat, TRUNCATION_NOTICE};
