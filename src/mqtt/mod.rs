//! MQTT adapter
//!
//! A proxy sitting between devices and an MQTT broker. CONNECT, PUBLISH and
//! SUBSCRIBE are checked against the auth service before they are
//! forwarded; accepted PUBLISH packets are also mirrored into the shared
//! broker so the other adapters see them.

mod hooks;
pub mod packet;
mod proxy;

use crate::utils::error::ErrorKind;

pub use hooks::{Hooks, MqttClient};
pub use packet::PacketError;
pub use proxy::MqttProxy;

/// CONNACK code for a refused CONNECT. Levels 3 and 4 use the 3.1.1 return
/// codes, level 5 the reason codes.
pub fn connack_code_for(kind: ErrorKind, level: u8) -> u8 {
    let v5 = level == packet::LEVEL_5;
    match kind {
        ErrorKind::Unavailable if v5 => 0x88,
        ErrorKind::Unavailable => 0x03,
        ErrorKind::Malformed if v5 => 0x81,
        ErrorKind::Internal if v5 => 0x80,
        _ if v5 => 0x87,
        _ => 0x05,
    }
}

#[cfg(test)]
mod tests;
