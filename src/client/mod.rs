//! The `client` module defines the per-subscriber state every long-lived
//! adapter session carries.
//!
//! It provides the `Client` record (identity plus subscription binding) and
//! the bounded `EgressQueue` that decouples broker delivery from slow sockets.

pub mod egress;
pub mod pubsub_client;

pub use egress::EgressQueue;
pub use pubsub_client::Client;
