//! CoAP adapter
//!
//! `POST /channels/{chanID}/messages[/...]?auth=<key>` publishes the payload;
//! `GET` with `Observe: 0` on the same path registers an observer that gets
//! one NON notification per envelope, and any other Observe value
//! deregisters it. Every request is answered with exactly one response.

pub mod message;
mod server;

use crate::utils::error::ErrorKind;

pub use message::{CoapError, CoapMessage, Code, MessageType};
pub use server::CoapServer;

const CONTENT_FORMATS: [(&str, u32); 9] = [
    ("text/plain", 0),
    ("application/link-format", 40),
    ("application/xml", 41),
    ("application/octet-stream", 42),
    ("application/exi", 47),
    ("application/json", 50),
    ("application/cbor", 60),
    ("application/senml+json", 110),
    ("application/senml+cbor", 112),
];

/// Response code for an error kind.
pub fn code_for(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::Unauthorized => Code::UNAUTHORIZED,
        ErrorKind::Malformed => Code::BAD_REQUEST,
        ErrorKind::NotFound => Code::NOT_FOUND,
        ErrorKind::Unavailable | ErrorKind::Conflict | ErrorKind::Internal => {
            Code::INTERNAL_SERVER_ERROR
        }
    }
}

/// Content-Format number for a media type; unknown types are `text/plain`.
pub fn content_format_for(content_type: &str) -> u32 {
    let media = content_type.split(';').next().unwrap_or_default().trim();
    CONTENT_FORMATS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(media))
        .map_or(0, |(_, format)| *format)
}

/// Media type for a Content-Format number, empty when unregistered.
pub fn content_type_for(format: u32) -> &'static str {
    CONTENT_FORMATS
        .iter()
        .find(|(_, f)| *f == format)
        .map_or("", |(name, _)| *name)
}

#[cfg(test)]
mod tests;
