//! HTTP adapter
//!
//! `POST /channels/{chanID}/messages[/{subtopic...}]` publishes the request
//! body as one envelope. The same listener also serves the operational
//! endpoints (`/health`, `/metrics`) that every other adapter exposes on its
//! own companion port through `ops_router`.

mod api;
mod ops;

use axum::http::StatusCode;

use crate::auth::AuthError;
use crate::utils::error::{Error, ErrorKind};

pub use api::{ALLOWED_CONTENT_TYPES, router};
pub use ops::{OpsState, ops_router, serve};

/// Wire status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::Malformed => StatusCode::BAD_REQUEST,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Like `status_for`, except an unreachable auth service is a bad gateway
/// rather than an unavailable broker.
pub fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Auth(AuthError::Unavailable(_)) => StatusCode::BAD_GATEWAY,
        other => status_for(other.kind()),
    }
}
