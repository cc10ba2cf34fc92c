use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::message::Message;
use crate::utils::error::ErrorKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("empty topic")]
    EmptyTopic,

    #[error("empty id")]
    EmptyId,

    #[error("subscriber {id} is already bound to {topic} in another queue group")]
    AlreadySubscribed { id: String, topic: String },

    #[error("not subscribed")]
    NotSubscribed,

    #[error("envelope has no publisher")]
    MissingPublisher,

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::EmptyTopic | BrokerError::EmptyId | BrokerError::MissingPublisher => {
                ErrorKind::Malformed
            }
            BrokerError::AlreadySubscribed { .. } => ErrorKind::Conflict,
            BrokerError::NotSubscribed => ErrorKind::NotFound,
            BrokerError::Unavailable(_) => ErrorKind::Unavailable,
            BrokerError::Codec(_) => ErrorKind::Internal,
        }
    }
}

/// Error a handler reports back to the broker; logged, never re-queued.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Receives envelopes for one subscription.
///
/// The broker invokes `handle` sequentially per subscription and calls
/// `cancel` exactly once when the subscription is torn down.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &Message) -> Result<(), HandlerError>;

    fn cancel(&self);
}

#[derive(Clone)]
pub struct SubscriberConfig {
    pub id: String,
    pub topic: String,
    /// Queue group for competing consumption; `None` delivers a full copy.
    pub queue: Option<String>,
    pub handler: Arc<dyn MessageHandler>,
}

impl SubscriberConfig {
    pub fn new(
        id: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            queue: None,
            handler,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

impl fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("queue", &self.queue)
            .finish()
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `msg` under channel `topic`. Returns once the broker has
    /// accepted the envelope.
    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), BrokerError>;

    /// Release the broker connection. Later publishes fail with
    /// `BrokerError::Unavailable`.
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Register a handler. Re-subscribing the same `(id, topic)` replaces the
    /// previous handler after running its `cancel`.
    async fn subscribe(&self, cfg: SubscriberConfig) -> Result<(), BrokerError>;

    /// Tear down a subscription. No handler invocation starts after this
    /// returns.
    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), BrokerError>;
}

pub trait PubSub: Publisher + Subscriber {}

impl<T: Publisher + Subscriber> PubSub for T {}

/// Checks shared by every publisher implementation.
pub fn validate_publish(topic: &str, msg: &Message) -> Result<(), BrokerError> {
    if topic.is_empty() || msg.channel.is_empty() {
        return Err(BrokerError::EmptyTopic);
    }
    if msg.publisher.is_empty() {
        return Err(BrokerError::MissingPublisher);
    }
    Ok(())
}

pub fn validate_subscription(id: &str, topic: &str) -> Result<(), BrokerError> {
    if id.is_empty() {
        return Err(BrokerError::EmptyId);
    }
    if topic.is_empty() {
        return Err(BrokerError::EmptyTopic);
    }
    Ok(())
}

#[async_trait]
impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), BrokerError> {
        (**self).publish(topic, msg).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }
}

#[async_trait]
impl<T: Subscriber + ?Sized> Subscriber for Arc<T> {
    async fn subscribe(&self, cfg: SubscriberConfig) -> Result<(), BrokerError> {
        (**self).subscribe(cfg).await
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), BrokerError> {
        (**self).unsubscribe(id, topic).await
    }
}
