use std::sync::Arc;

use tracing::{debug, warn};

use super::handler::QueueHandler;
use crate::auth::AuthClient;
use crate::client::Client;
use crate::messaging::topic::parse_publish_subtopic;
use crate::messaging::{Message, Protocol, PubSub, SubscriberConfig};
use crate::utils::error::{Error, ErrorKind, Result};
use crate::utils::metrics::record_request;

/// One decoded ingress publish, before authorization.
#[derive(Debug, Clone, Default)]
pub struct Inbound {
    pub channel: String,
    /// Subtopic exactly as it appeared on the wire (still escaped).
    pub subtopic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub content_type: String,
}

#[derive(Clone)]
pub struct Adapter {
    protocol: Protocol,
    auth: Arc<dyn AuthClient>,
    pubsub: Arc<dyn PubSub>,
}

impl Adapter {
    pub fn new(protocol: Protocol, auth: Arc<dyn AuthClient>, pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            protocol,
            auth,
            pubsub,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn auth(&self) -> &Arc<dyn AuthClient> {
        &self.auth
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.pubsub
    }

    /// Resolve the publisher identity for `key` on `channel`.
    pub async fn authorize(&self, channel: &str, key: Option<&str>) -> Result<String> {
        let key = key.filter(|k| !k.is_empty()).ok_or(Error::MissingCredentials)?;
        Ok(self.auth.can_access(channel, key).await?)
    }

    /// Authorize and publish one ingress message. Nothing reaches the broker
    /// unless authorization succeeded.
    pub async fn publish(&self, inbound: Inbound) -> Result<Message> {
        let result = self.try_publish(inbound).await;
        self.record(&result);
        result
    }

    async fn try_publish(&self, inbound: Inbound) -> Result<Message> {
        let subtopic = parse_publish_subtopic(&inbound.subtopic)?;
        let publisher = self
            .authorize(&inbound.channel, inbound.key.as_deref())
            .await?;

        let msg = Message::new(
            self.protocol,
            inbound.channel,
            subtopic,
            publisher,
            inbound.payload,
            inbound.content_type,
        );
        self.pubsub.publish(&msg.channel, &msg).await?;
        Ok(msg)
    }

    /// Publish an envelope whose publisher was already resolved, as the MQTT
    /// proxy does after its own authorization hooks.
    pub async fn forward(&self, msg: &Message) -> Result<()> {
        let result = self
            .pubsub
            .publish(&msg.channel, msg)
            .await
            .map_err(Error::from);
        self.record(&result);
        result
    }

    /// Bind a broker subscription to `client`'s egress queue.
    pub async fn subscribe(&self, client: &Client, skip_echo: bool) -> Result<()> {
        let mut handler = QueueHandler::new(client.queue.clone());
        if skip_echo {
            handler = handler.without_echo(client.publisher.clone());
        }
        let cfg = SubscriberConfig::new(client.id.clone(), client.topic(), Arc::new(handler));
        self.pubsub.subscribe(cfg).await?;
        debug!(protocol = %self.protocol, client = %client.id, topic = %client.topic(), "client subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, client: &Client) -> Result<()> {
        self.pubsub.unsubscribe(&client.id, &client.topic()).await?;
        debug!(protocol = %self.protocol, client = %client.id, "client unsubscribed");
        Ok(())
    }

    fn record<T>(&self, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => {
                if e.kind() == ErrorKind::Internal {
                    warn!(protocol = %self.protocol, error = %e, "publish failed");
                }
                e.kind().as_str()
            }
        };
        record_request(self.protocol.as_str(), outcome);
    }
}
