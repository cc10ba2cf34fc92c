//! RFC 7252 message framing.
//!
//! ```text
//!  0                   1                   2                   3
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```

use std::fmt;

use thiserror::Error;

use crate::utils::error::ErrorKind;

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LEN: usize = 8;

pub const OBSERVE: u16 = 6;
pub const URI_PATH: u16 = 11;
pub const CONTENT_FORMAT: u16 = 12;
pub const URI_QUERY: u16 = 15;

#[derive(Debug, Error)]
pub enum CoapError {
    #[error("message truncated")]
    Truncated,

    #[error("unsupported version {0}")]
    BadVersion(u8),

    #[error("invalid token length {0}")]
    InvalidTokenLength(usize),

    #[error("invalid option: {0}")]
    InvalidOption(&'static str),

    #[error("payload marker followed by empty payload")]
    EmptyPayload,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoapError::Io(_) => ErrorKind::Unavailable,
            _ => ErrorKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// Request method or response code, `class.detail`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CREATED: Code = Code::new(2, 1);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1F))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self != Code::EMPTY
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// Kept sorted by option number; repeated options keep their order.
    options: Vec<(u16, Vec<u8>)>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new(mtype: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            mtype,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_token(mut self, token: &[u8]) -> Self {
        self.token = token.to_vec();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let at = self.options.partition_point(|(n, _)| *n <= number);
        self.options.insert(at, (number, value));
    }

    pub fn with_option(mut self, number: u16, value: Vec<u8>) -> Self {
        self.add_option(number, value);
        self
    }

    pub fn set_uint_option(&mut self, number: u16, value: u32) {
        self.options.retain(|(n, _)| *n != number);
        self.add_option(number, encode_uint(value));
    }

    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, v)| v.as_slice())
    }

    pub fn options(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |(n, _)| *n == number)
            .map(|(_, v)| v.as_slice())
    }

    /// Observe option, if present.
    pub fn observe(&self) -> Option<Result<u32, CoapError>> {
        self.option(OBSERVE).map(decode_uint)
    }

    pub fn content_format(&self) -> Option<Result<u32, CoapError>> {
        self.option(CONTENT_FORMAT).map(decode_uint)
    }

    /// Uri-Path options joined into an absolute path.
    pub fn path(&self) -> String {
        let mut path = String::new();
        for segment in self.options(URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Value of the `name=value` Uri-Query option.
    pub fn query(&self, name: &str) -> Option<String> {
        self.options(URI_QUERY).find_map(|raw| {
            let text = std::str::from_utf8(raw).ok()?;
            let (key, value) = text.split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CoapError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CoapError::InvalidTokenLength(self.token.len()));
        }
        let mut out = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        out.push((VERSION << 6) | (self.mtype.bits() << 4) | self.token.len() as u8);
        out.push(self.code.0);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        let mut previous = 0u16;
        for (number, value) in &self.options {
            let delta = number - previous;
            previous = *number;
            let (delta_nibble, delta_ext) = extend(delta as usize)?;
            let (len_nibble, len_ext) = extend(value.len())?;
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(value);
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoapError> {
        if bytes.len() < 4 {
            return Err(CoapError::Truncated);
        }
        let version = bytes[0] >> 6;
        if version != VERSION {
            return Err(CoapError::BadVersion(version));
        }
        let mtype = MessageType::from_bits(bytes[0] >> 4);
        let token_len = (bytes[0] & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(CoapError::InvalidTokenLength(token_len));
        }
        let code = Code(bytes[1]);
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut offset = 4;
        let token = bytes
            .get(offset..offset + token_len)
            .ok_or(CoapError::Truncated)?
            .to_vec();
        offset += token_len;

        let mut options = Vec::new();
        let mut number = 0u16;
        let mut payload = Vec::new();
        while offset < bytes.len() {
            let head = bytes[offset];
            offset += 1;
            if head == PAYLOAD_MARKER {
                if offset == bytes.len() {
                    return Err(CoapError::EmptyPayload);
                }
                payload = bytes[offset..].to_vec();
                break;
            }
            let delta = read_extended(head >> 4, bytes, &mut offset)?;
            let len = read_extended(head & 0x0F, bytes, &mut offset)?;
            number = number
                .checked_add(u16::try_from(delta).map_err(|_| CoapError::InvalidOption("delta overflow"))?)
                .ok_or(CoapError::InvalidOption("option number overflow"))?;
            let value = bytes
                .get(offset..offset + len)
                .ok_or(CoapError::Truncated)?
                .to_vec();
            offset += len;
            options.push((number, value));
        }

        Ok(Self {
            mtype,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn extend(value: usize) -> Result<(u8, Vec<u8>), CoapError> {
    match value {
        0..=12 => Ok((value as u8, Vec::new())),
        13..=268 => Ok((13, vec![(value - 13) as u8])),
        269..=65_804 => Ok((14, ((value - 269) as u16).to_be_bytes().to_vec())),
        _ => Err(CoapError::InvalidOption("option too large")),
    }
}

fn read_extended(nibble: u8, bytes: &[u8], offset: &mut usize) -> Result<usize, CoapError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let b = *bytes.get(*offset).ok_or(CoapError::Truncated)?;
            *offset += 1;
            Ok(b as usize + 13)
        }
        14 => {
            let raw = bytes.get(*offset..*offset + 2).ok_or(CoapError::Truncated)?;
            *offset += 2;
            Ok(u16::from_be_bytes([raw[0], raw[1]]) as usize + 269)
        }
        _ => Err(CoapError::InvalidOption("reserved nibble 15")),
    }
}

/// Minimal big-endian encoding of an unsigned option value.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(raw: &[u8]) -> Result<u32, CoapError> {
    if raw.len() > 4 {
        return Err(CoapError::InvalidOption("uint option longer than 4 bytes"));
    }
    Ok(raw.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}
