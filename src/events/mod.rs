//! The `events` module keeps the presence stream the MQTT adapter feeds.
//!
//! Connect and disconnect transitions are appended to a bounded, durable
//! stream backed by `sled`. Consumers read through named groups and
//! acknowledge what they processed; anything not acknowledged is handed out
//! again on the next read.

pub mod sled_stream;

pub use sled_stream::{EventStore, PresenceEvent, PresenceKind};
