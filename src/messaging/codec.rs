//! Binary wire format for envelopes on the broker.
//!
//! A single version byte precedes the bincode body so the schema can evolve
//! without ambiguity.

use bytes::{BufMut, Bytes, BytesMut};

use super::message::Message;
use super::pubsub::BrokerError;

pub const WIRE_VERSION: u8 = 1;

pub fn encode(msg: &Message) -> Result<Bytes, BrokerError> {
    let body = bincode::serialize(msg).map_err(|e| BrokerError::Codec(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_u8(WIRE_VERSION);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

pub fn decode(data: &[u8]) -> Result<Message, BrokerError> {
    match data.split_first() {
        Some((&WIRE_VERSION, body)) => {
            bincode::deserialize(body).map_err(|e| BrokerError::Codec(e.to_string()))
        }
        Some((version, _)) => Err(BrokerError::Codec(format!(
            "unsupported wire version {version}"
        ))),
        None => Err(BrokerError::Codec("empty frame".to_string())),
    }
}
