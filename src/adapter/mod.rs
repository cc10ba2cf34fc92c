//! Ingress layer shared by every protocol adapter.
//!
//! Protocol front-ends decode their wire format into an `Inbound` and hand
//! it to `Adapter`, which owns the authorize → envelope → publish sequence
//! and the binding of broker subscriptions to client egress queues. Only the
//! wire specifics live in `http`, `ws`, `mqtt` and `coap`.

mod handler;
mod service;

pub use handler::QueueHandler;
pub use service::{Adapter, Inbound};
