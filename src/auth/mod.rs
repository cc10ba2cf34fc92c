//! Device authorization.
//!
//! Every ingress path asks an `AuthClient` whether a device key may use a
//! channel before anything reaches the broker. Results are never cached.

mod credentials;
mod http;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::utils::error::ErrorKind;

pub use credentials::key_from_authorization;
pub use http::HttpAuthClient;
pub use memory::MemoryAuth;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unauthorized access")]
    Unauthorized,

    #[error("auth service unavailable: {0}")]
    Unavailable(String),

    #[error("auth client setup failed: {0}")]
    Setup(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Unauthorized => ErrorKind::Unauthorized,
            AuthError::Unavailable(_) => ErrorKind::Unavailable,
            AuthError::Setup(_) => ErrorKind::Internal,
        }
    }
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Resolve `key` to the publisher identity allowed on `channel`.
    async fn can_access(&self, channel: &str, key: &str) -> Result<String, AuthError>;

    /// Resolve `key` to the thing it belongs to, without a channel check.
    async fn identify(&self, key: &str) -> Result<String, AuthError>;
}
