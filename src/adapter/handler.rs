use std::sync::Arc;

use async_trait::async_trait;

use crate::client::EgressQueue;
use crate::messaging::{HandlerError, Message, MessageHandler};

/// Broker handler feeding a client's egress queue.
///
/// It never touches the socket itself, so the broker's dispatcher is only
/// held for the duration of a queue push.
pub struct QueueHandler {
    queue: Arc<EgressQueue<Message>>,
    skip_publisher: Option<String>,
}

impl QueueHandler {
    pub fn new(queue: Arc<EgressQueue<Message>>) -> Self {
        Self {
            queue,
            skip_publisher: None,
        }
    }

    /// Drop envelopes published by `publisher` so a session never receives
    /// its own messages back.
    pub fn without_echo(mut self, publisher: impl Into<String>) -> Self {
        self.skip_publisher = Some(publisher.into());
        self
    }
}

#[async_trait]
impl MessageHandler for QueueHandler {
    async fn handle(&self, msg: &Message) -> Result<(), HandlerError> {
        if self.skip_publisher.as_deref() == Some(msg.publisher.as_str()) {
            return Ok(());
        }
        if !self.queue.push(msg.clone()) {
            return Err(HandlerError("egress queue closed".to_string()));
        }
        Ok(())
    }

    fn cancel(&self) {
        self.queue.close();
    }
}
