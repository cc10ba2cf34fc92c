//! Error taxonomy shared by every adapter.
//!
//! Module-level errors (`TopicError`, `BrokerError`, `AuthError`, ...) stay
//! precise about what failed; `ErrorKind` collapses them into the six
//! outcomes adapters translate into wire statuses.

use thiserror::Error;

use crate::auth::AuthError;
use crate::messaging::{BrokerError, TopicError};

/// Coarse classification every adapter maps to its own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Credential missing or rejected.
    Unauthorized,
    /// Bad topic, body or option.
    Malformed,
    /// Broker or auth transport down.
    Unavailable,
    /// Unknown route or subscription.
    NotFound,
    /// Resubscribe race or duplicate bind.
    Conflict,
    /// Anything unexpected.
    Internal,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors raised by the sled-backed stores (presence events, route map).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupted entry under key {0}")]
    Corrupted(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Sled(_) => ErrorKind::Unavailable,
            StoreError::Serialization(_) | StoreError::Corrupted(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing credentials")]
    MissingCredentials,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Topic(e) => e.kind(),
            Error::Broker(e) => e.kind(),
            Error::Auth(e) => e.kind(),
            Error::Store(e) => e.kind(),
            Error::MissingCredentials => ErrorKind::Unauthorized,
            Error::Config(_) | Error::Io(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}
