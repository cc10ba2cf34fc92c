//! messaging
//!
//! The envelope every adapter produces, the topic codec, and the broker
//! abstraction (`Publisher` / `Subscriber` / `PubSub`) together with the
//! in-process engine and the wrappers stacked around it.

pub mod codec;
pub mod engine;
pub mod message;
pub mod middleware;
pub mod pubsub;
pub mod spill;
pub mod topic;

use std::sync::Arc;

pub use engine::MemoryBroker;
pub use message::{Message, Protocol};
pub use pubsub::{
    BrokerError, HandlerError, MessageHandler, PubSub, Publisher, Subscriber, SubscriberConfig,
};
pub use spill::SpillPublisher;
pub use topic::TopicError;

use middleware::{Logging, Metrics};

const MEMORY_SCHEME: &str = "memory://";

/// A connected broker: the shared `PubSub` handle adapters use, plus the
/// spill buffer so the caller can drive its flush loop.
#[derive(Clone)]
pub struct Broker {
    pub pubsub: Arc<dyn PubSub>,
    pub spill: Arc<SpillPublisher<MemoryBroker>>,
}

/// Connect to the broker named by `url`.
pub fn connect(url: &str, spill_capacity: usize) -> Result<Broker, BrokerError> {
    if !url.starts_with(MEMORY_SCHEME) {
        return Err(BrokerError::Unavailable(format!(
            "unsupported broker url {url:?}; only {MEMORY_SCHEME} is built in"
        )));
    }
    let spill = Arc::new(SpillPublisher::new(MemoryBroker::new(), spill_capacity));
    let pubsub: Arc<dyn PubSub> = Arc::new(Logging::new(Metrics::new(spill.clone())));
    Ok(Broker { pubsub, spill })
}
