//! Topic codec
//!
//! Broker subjects have the form `channels.<chanID>[.<seg1>.<seg2>...]`.
//! Adapters receive the subtopic as a URL path suffix, an MQTT topic suffix
//! or CoAP Uri-Path options; all of them go through `parse_subtopic` (or one
//! of its publish/subscribe variants) before reaching an envelope.

use thiserror::Error;

use crate::utils::error::ErrorKind;

pub const CHANNELS_PREFIX: &str = "channels";

const MESSAGES_SEGMENT: &str = "messages";
const PUBLISH_FORBIDDEN: [char; 5] = [' ', '#', '+', '*', '>'];
const SUBSCRIBE_FORBIDDEN: [char; 3] = [' ', '#', '+'];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("malformed topic")]
    MalformedTopic,

    #[error("malformed subtopic")]
    MalformedSubtopic,
}

impl TopicError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Malformed
    }
}

/// Wildcard flavour of the broker in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Nats,
    Amqp,
}

impl Dialect {
    /// Subject pattern covering every channel.
    pub fn all_channels(self) -> String {
        match self {
            Dialect::Nats => format!("{CHANNELS_PREFIX}.>"),
            Dialect::Amqp => format!("{CHANNELS_PREFIX}.#"),
        }
    }
}

/// Query-unescape: `+` becomes a space and `%XX` escapes are decoded.
/// Truncated or non-hex escapes and non-UTF-8 results are rejected.
pub fn unescape(raw: &str) -> Result<String, TopicError> {
    let well_formed = raw.split('%').skip(1).all(|rest| {
        rest.as_bytes()
            .get(..2)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit))
    });
    if !well_formed {
        return Err(TopicError::MalformedSubtopic);
    }
    urlencoding::decode(&raw.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .map_err(|_| TopicError::MalformedSubtopic)
}

/// Structural normalization: `/` becomes `.`, empty segments are dropped and
/// multi-character segments may not carry `*` or `>`.
///
/// The output contains neither `/` nor empty segments, so applying it twice
/// yields the same string.
pub fn normalize_subtopic(subtopic: &str) -> Result<String, TopicError> {
    let replaced = subtopic.replace('/', ".");
    let mut segments = Vec::new();
    for segment in replaced.split('.') {
        if segment.is_empty() {
            continue;
        }
        if segment.len() > 1 && (segment.contains('*') || segment.contains('>')) {
            return Err(TopicError::MalformedSubtopic);
        }
        segments.push(segment);
    }
    Ok(segments.join("."))
}

/// URL-decode then normalize an adapter-supplied subtopic.
pub fn parse_subtopic(raw: &str) -> Result<String, TopicError> {
    if raw.is_empty() {
        return Ok(String::new());
    }
    normalize_subtopic(&unescape(raw)?)
}

/// Subtopic for an envelope being published. No segment may contain a
/// space, `#`, `+`, `*` or `>`.
pub fn parse_publish_subtopic(raw: &str) -> Result<String, TopicError> {
    let subtopic = parse_subtopic(raw)?;
    if subtopic.contains(PUBLISH_FORBIDDEN) {
        return Err(TopicError::MalformedSubtopic);
    }
    Ok(subtopic)
}

/// Subtopic for a subscription. `+` maps to the single-segment wildcard `*`
/// and `#` to the terminal wildcard `>`.
pub fn parse_subscribe_subtopic(raw: &str) -> Result<String, TopicError> {
    if raw.is_empty() {
        return Ok(String::new());
    }
    let mapped = raw.replace('+', "*").replace('#', ">");
    let subtopic = normalize_subtopic(&unescape(&mapped)?)?;

    let segments: Vec<&str> = subtopic.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.contains(SUBSCRIBE_FORBIDDEN) {
            return Err(TopicError::MalformedSubtopic);
        }
        if *segment == ">" && i + 1 != segments.len() {
            return Err(TopicError::MalformedSubtopic);
        }
    }
    Ok(subtopic)
}

/// Channel identifiers are `[A-Za-z0-9_-]+`.
pub fn valid_channel_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Split `/channels/<chanID>/messages[/<subtopic...>]` into the channel id
/// and the raw (still escaped) subtopic suffix. A query string is ignored.
pub fn parse_channel_path(path: &str) -> Result<(String, String), TopicError> {
    let path = path.split('?').next().unwrap_or_default();
    let path = path.strip_prefix('/').unwrap_or(path);

    let rest = path
        .strip_prefix(CHANNELS_PREFIX)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or(TopicError::MalformedTopic)?;
    let (channel, rest) = rest.split_once('/').ok_or(TopicError::MalformedTopic)?;
    if !valid_channel_id(channel) {
        return Err(TopicError::MalformedTopic);
    }

    let suffix = rest
        .strip_prefix(MESSAGES_SEGMENT)
        .ok_or(TopicError::MalformedTopic)?;
    if !suffix.is_empty() && !suffix.starts_with('/') {
        return Err(TopicError::MalformedTopic);
    }

    Ok((channel.to_string(), suffix.to_string()))
}

/// Broker subject for a channel and normalized subtopic.
pub fn channel_subject(channel: &str, subtopic: &str) -> String {
    if subtopic.is_empty() {
        format!("{CHANNELS_PREFIX}.{channel}")
    } else {
        format!("{CHANNELS_PREFIX}.{channel}.{subtopic}")
    }
}

/// Whether `subject` matches `pattern`. `*` matches exactly one token; `>`
/// (or `#`) matches one or more trailing tokens.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(p) = pattern_tokens.next() {
        if p == ">" || p == "#" {
            return pattern_tokens.peek().is_none() && subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == "*" || p == s => continue,
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}
