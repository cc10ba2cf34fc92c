//! Message envelope
//!
//! `Message` is the canonical representation crossing the broker. Adapters
//! build one per ingress arrival and hand out shared references only, so an
//! envelope is never mutated after construction.
//!
//! Notes on fields:
//! - `channel`: routing key, never empty once the envelope reaches the broker
//! - `subtopic`: normalized dot-separated suffix, possibly empty
//! - `publisher`: identity resolved by the auth service
//! - `created_at`: nanoseconds since UNIX epoch captured at adapter entry

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Wire protocol an envelope arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Ws,
    Mqtt,
    Coap,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Ws => "ws",
            Protocol::Mqtt => "mqtt",
            Protocol::Coap => "coap",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "ws" => Ok(Protocol::Ws),
            "mqtt" => Ok(Protocol::Mqtt),
            "coap" => Ok(Protocol::Coap),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub subtopic: String,
    pub publisher: String,
    pub protocol: Protocol,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub created_at: i64,
}

impl Message {
    /// Build an envelope stamped with the current time.
    pub fn new(
        protocol: Protocol,
        channel: impl Into<String>,
        subtopic: impl Into<String>,
        publisher: impl Into<String>,
        payload: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            subtopic: subtopic.into(),
            publisher: publisher.into(),
            protocol,
            payload,
            content_type: content_type.into(),
            created_at: now_nanos(),
        }
    }
}

/// Nanoseconds since UNIX epoch, saturating at `i64::MAX`.
pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
