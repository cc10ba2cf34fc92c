//! MQTT packet codec
//!
//! Just enough of MQTT 3.1 / 3.1.1 / 5 to inspect what a client sends
//! through the proxy: the fixed header framing, CONNECT, PUBLISH and
//! SUBSCRIBE. Everything else is forwarded as opaque bytes. Packets are
//! kept in their raw form so the upstream broker receives them unchanged.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::utils::error::ErrorKind;

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const SUBSCRIBE: u8 = 8;
pub const DISCONNECT: u8 = 14;

pub const LEVEL_3_1: u8 = 3;
pub const LEVEL_3_1_1: u8 = 4;
pub const LEVEL_5: u8 = 5;

/// MQTT limits the remaining length to 268,435,455 (four varint bytes).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const USERNAME_FLAG: u8 = 0x80;
const PASSWORD_FLAG: u8 = 0x40;
const WILL_FLAG: u8 = 0x04;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("incomplete packet")]
    Incomplete,

    #[error("invalid remaining length encoding")]
    InvalidLength,

    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("invalid protocol name {0:?}")]
    InvalidProtocolName(String),

    #[error("unsupported protocol level {0}")]
    UnsupportedProtocolLevel(u8),

    #[error("unexpected packet type {0}")]
    UnexpectedType(u8),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PacketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PacketError::Io(_) => ErrorKind::Unavailable,
            _ => ErrorKind::Malformed,
        }
    }
}

/// Decode a remaining-length varint. Returns the value and how many bytes
/// it occupied.
pub fn read_variable_length(bytes: &[u8]) -> Result<(usize, usize), PacketError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, byte) in bytes.iter().enumerate() {
        if i == 4 {
            return Err(PacketError::InvalidLength);
        }
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        multiplier *= 128;
    }
    if bytes.len() >= 4 {
        return Err(PacketError::InvalidLength);
    }
    Err(PacketError::Incomplete)
}

pub fn write_variable_length(value: usize, buffer: &mut Vec<u8>) -> Result<usize, PacketError> {
    if value > MAX_REMAINING_LENGTH {
        return Err(PacketError::InvalidLength);
    }
    let mut encoded = value;
    let mut written = 0;
    loop {
        let mut byte = (encoded & 0x7F) as u8;
        encoded >>= 7;
        if encoded > 0 {
            byte |= 0x80;
        }
        buffer.push(byte);
        written += 1;
        if encoded == 0 {
            return Ok(written);
        }
    }
}

pub fn read_u16(bytes: &[u8], offset: &mut usize) -> Result<u16, PacketError> {
    let raw = bytes
        .get(*offset..*offset + 2)
        .ok_or(PacketError::Incomplete)?;
    *offset += 2;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

/// Length-prefixed binary data.
pub fn read_binary<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a [u8], PacketError> {
    let len = read_u16(bytes, offset)? as usize;
    let data = bytes
        .get(*offset..*offset + len)
        .ok_or(PacketError::Incomplete)?;
    *offset += len;
    Ok(data)
}

pub fn read_string(bytes: &[u8], offset: &mut usize) -> Result<String, PacketError> {
    let raw = read_binary(bytes, offset)?;
    String::from_utf8(raw.to_vec()).map_err(|_| PacketError::Malformed("string is not UTF-8"))
}

pub fn write_string(value: &str, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buffer.extend_from_slice(value.as_bytes());
}

/// Skip an MQTT 5 property block.
fn skip_properties(bytes: &[u8], offset: &mut usize) -> Result<(), PacketError> {
    let rest = bytes.get(*offset..).ok_or(PacketError::Incomplete)?;
    let (len, used) = read_variable_length(rest)?;
    let end = *offset + used + len;
    if end > bytes.len() {
        return Err(PacketError::Incomplete);
    }
    *offset = end;
    Ok(())
}

/// One complete packet as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub packet_type: u8,
    pub flags: u8,
    header_len: usize,
    pub bytes: Vec<u8>,
}

impl RawPacket {
    /// Variable header and payload, without the fixed header.
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.header_len..]
    }
}

/// Frame a packet from its first byte and body.
pub fn encode_packet(first_byte: u8, body: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(first_byte);
    write_variable_length(body.len(), &mut out)?;
    out.extend_from_slice(body);
    Ok(out)
}

/// Read the next packet from `reader`. Returns `None` on a clean end of
/// stream between packets.
pub async fn read_packet<R>(reader: &mut R, max_size: usize) -> Result<Option<RawPacket>, PacketError>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }

    let mut bytes = vec![first[0]];
    let remaining = loop {
        let byte = reader.read_u8().await?;
        bytes.push(byte);
        match read_variable_length(&bytes[1..]) {
            Ok((value, _)) => break value,
            Err(PacketError::Incomplete) => continue,
            Err(e) => return Err(e),
        }
    };

    let header_len = bytes.len();
    let size = header_len + remaining;
    if size > max_size {
        return Err(PacketError::TooLarge {
            size,
            max: max_size,
        });
    }
    bytes.resize(size, 0);
    reader.read_exact(&mut bytes[header_len..]).await?;

    Ok(Some(RawPacket {
        packet_type: first[0] >> 4,
        flags: first[0] & 0x0F,
        header_len,
        bytes,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub level: u8,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

pub fn parse_connect(body: &[u8]) -> Result<Connect, PacketError> {
    let mut offset = 0;
    let name = read_string(body, &mut offset)?;
    let level = *body.get(offset).ok_or(PacketError::Incomplete)?;
    offset += 1;
    match (name.as_str(), level) {
        ("MQIsdp", LEVEL_3_1) | ("MQTT", LEVEL_3_1_1) | ("MQTT", LEVEL_5) => {}
        ("MQIsdp", _) | ("MQTT", _) => return Err(PacketError::UnsupportedProtocolLevel(level)),
        _ => return Err(PacketError::InvalidProtocolName(name)),
    }

    let flags = *body.get(offset).ok_or(PacketError::Incomplete)?;
    offset += 1;
    if flags & 0x01 != 0 {
        return Err(PacketError::Malformed("reserved connect flag set"));
    }
    let _keep_alive = read_u16(body, &mut offset)?;
    if level == LEVEL_5 {
        skip_properties(body, &mut offset)?;
    }

    let client_id = read_string(body, &mut offset)?;
    if flags & WILL_FLAG != 0 {
        if level == LEVEL_5 {
            skip_properties(body, &mut offset)?;
        }
        read_string(body, &mut offset)?;
        read_binary(body, &mut offset)?;
    }
    let username = if flags & USERNAME_FLAG != 0 {
        Some(read_string(body, &mut offset)?)
    } else {
        None
    };
    let password = if flags & PASSWORD_FLAG != 0 {
        Some(read_binary(body, &mut offset)?.to_vec())
    } else {
        None
    };

    Ok(Connect {
        level,
        client_id,
        username,
        password,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

pub fn parse_publish(flags: u8, body: &[u8], level: u8) -> Result<Publish, PacketError> {
    let qos = (flags >> 1) & 0x03;
    if qos == 3 {
        return Err(PacketError::Malformed("invalid QoS 3"));
    }

    let mut offset = 0;
    let topic = read_string(body, &mut offset)?;
    let packet_id = if qos > 0 {
        Some(read_u16(body, &mut offset)?)
    } else {
        None
    };
    if level == LEVEL_5 {
        skip_properties(body, &mut offset)?;
    }

    Ok(Publish {
        topic,
        qos,
        packet_id,
        payload: body[offset..].to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

pub fn parse_subscribe(body: &[u8], level: u8) -> Result<Subscribe, PacketError> {
    let mut offset = 0;
    let packet_id = read_u16(body, &mut offset)?;
    if level == LEVEL_5 {
        skip_properties(body, &mut offset)?;
    }

    let mut filters = Vec::new();
    while offset < body.len() {
        filters.push(read_string(body, &mut offset)?);
        // subscription options / requested QoS
        offset += 1;
        if offset > body.len() {
            return Err(PacketError::Incomplete);
        }
    }
    if filters.is_empty() {
        return Err(PacketError::Malformed("subscribe without topic filters"));
    }
    Ok(Subscribe { packet_id, filters })
}

/// CONNACK with `code` as return code (v3/v4) or reason code (v5).
pub fn encode_connack(level: u8, code: u8) -> Vec<u8> {
    let mut body = vec![0x00, code];
    if level == LEVEL_5 {
        body.push(0x00);
    }
    let mut out = vec![CONNACK << 4, body.len() as u8];
    out.extend_from_slice(&body);
    out
}
