use std::sync::Arc;

use tracing::{info, warn};

use super::packet::{Connect, Publish};
use crate::adapter::Adapter;
use crate::auth::AuthError;
use crate::events::{EventStore, PresenceEvent, PresenceKind};
use crate::messaging::topic::{parse_channel_path, parse_publish_subtopic, parse_subscribe_subtopic};
use crate::messaging::{Message, Protocol};
use crate::utils::error::{Error, Result};

/// What the proxy remembers about an authenticated MQTT client.
#[derive(Debug, Clone)]
pub struct MqttClient {
    pub client_id: String,
    pub thing_id: String,
    pub key: String,
    pub level: u8,
}

/// Interception points the proxy calls around forwarded packets.
#[derive(Clone)]
pub struct Hooks {
    adapter: Adapter,
    events: Option<Arc<EventStore>>,
    instance_id: String,
}

impl Hooks {
    pub fn new(adapter: Adapter, events: Option<Arc<EventStore>>, instance_id: impl Into<String>) -> Self {
        Self {
            adapter,
            events,
            instance_id: instance_id.into(),
        }
    }

    /// Authenticate a CONNECT by its password. When a username is present it
    /// must name the thing the key belongs to.
    pub async fn auth_connect(&self, connect: &Connect) -> Result<MqttClient> {
        let key = connect
            .password
            .as_deref()
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .filter(|k| !k.is_empty())
            .ok_or(Error::MissingCredentials)?;

        let thing_id = self.adapter.auth().identify(key).await?;
        if let Some(username) = connect.username.as_deref().filter(|u| !u.is_empty()) {
            if username != thing_id {
                return Err(AuthError::Unauthorized.into());
            }
        }

        let client = MqttClient {
            client_id: connect.client_id.clone(),
            thing_id,
            key: key.to_string(),
            level: connect.level,
        };
        self.presence(PresenceKind::Connected, &client);
        info!(client = %client.client_id, thing = %client.thing_id, "mqtt client connected");
        Ok(client)
    }

    /// Check a PUBLISH and build the envelope mirrored to the broker once the
    /// packet has been forwarded.
    pub async fn auth_publish(&self, client: &MqttClient, publish: &Publish) -> Result<Message> {
        let (channel, raw) = parse_channel_path(&publish.topic)?;
        let subtopic = parse_publish_subtopic(&raw)?;
        let publisher = self.adapter.authorize(&channel, Some(&client.key)).await?;
        Ok(Message::new(
            Protocol::Mqtt,
            channel,
            subtopic,
            publisher,
            publish.payload.clone(),
            "",
        ))
    }

    /// Every filter must name a channel the client may use.
    pub async fn auth_subscribe(&self, client: &MqttClient, filters: &[String]) -> Result<()> {
        for filter in filters {
            let (channel, raw) = parse_channel_path(filter)?;
            parse_subscribe_subtopic(&raw)?;
            self.adapter.authorize(&channel, Some(&client.key)).await?;
        }
        Ok(())
    }

    /// Post-hook: mirror a forwarded PUBLISH into the shared broker.
    pub async fn publish(&self, client: &MqttClient, msg: &Message) {
        if let Err(e) = self.adapter.forward(msg).await {
            warn!(client = %client.client_id, channel = %msg.channel, error = %e, "failed to mirror publish to broker");
        }
    }

    pub fn disconnect(&self, client: &MqttClient) {
        info!(client = %client.client_id, thing = %client.thing_id, "mqtt client disconnected");
        self.presence(PresenceKind::Disconnected, client);
    }

    fn presence(&self, kind: PresenceKind, client: &MqttClient) {
        let Some(events) = &self.events else {
            return;
        };
        let event = PresenceEvent::new(kind, &client.client_id, &client.thing_id, &self.instance_id);
        if let Err(e) = events.append(&event) {
            warn!(client = %client.client_id, error = %e, "failed to record presence event");
        }
    }
}
