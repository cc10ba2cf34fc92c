use std::sync::Arc;

use uuid::Uuid;

use super::egress::EgressQueue;
use crate::messaging::Message;
use crate::messaging::topic::channel_subject;

/// A subscriber bound to one channel/subtopic on behalf of a device.
///
/// Each client is uniquely identified by an `id` used as the broker
/// subscriber id, and owns the queue its broker handler feeds.
#[derive(Clone)]
pub struct Client {
    /// Unique subscriber identifier (UUID v4).
    pub id: String,

    pub channel: String,

    /// Normalized subtopic pattern, possibly empty.
    pub subtopic: String,

    /// Identity resolved by the auth service.
    pub publisher: String,

    /// Envelopes waiting to be written to the peer.
    pub queue: Arc<EgressQueue<Message>>,
}

impl Client {
    pub fn new(
        channel: impl Into<String>,
        subtopic: impl Into<String>,
        publisher: impl Into<String>,
        queue: Arc<EgressQueue<Message>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.into(),
            subtopic: subtopic.into(),
            publisher: publisher.into(),
            queue,
        }
    }

    /// Broker subject pattern this client listens on.
    pub fn topic(&self) -> String {
        channel_subject(&self.channel, &self.subtopic)
    }
}
