//! # mirror-transport
//!
//! Viewer wire protocol and the broadcast layer: `{channel, sequence,
//! payload}` envelopes fanned out at-least-once to subscribed viewers,
//! with per-(viewer, channel) sequences for gap detection and a disconnect
//! grace window for seamless reconnects.

pub mod broadcast;
pub mod error;
pub mod protocol;

pub use broadcast::Broadcaster;
pub use error::TransportError;
pub use protocol::{Channel, Envelope, SubscriptionFilter, ViewerPayload};
