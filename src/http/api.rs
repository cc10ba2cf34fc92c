use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tracing::{debug, warn};

use super::error_status;
use super::ops::{OpsState, ops_router};
use crate::adapter::{Adapter, Inbound};
use crate::auth::key_from_authorization;
use crate::messaging::topic::parse_channel_path;
use crate::utils::error::{Error, ErrorKind};
use crate::utils::metrics::record_request;

pub const ALLOWED_CONTENT_TYPES: [&str; 3] = [
    "application/senml+json",
    "application/senml+cbor",
    "application/json",
];

/// Media type without parameters, lowercased.
fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next().unwrap_or_default().trim();
    Some(essence.to_ascii_lowercase())
}

async fn publish_handler(
    State(adapter): State<Adapter>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(content_type) =
        media_type(&headers).filter(|ct| ALLOWED_CONTENT_TYPES.contains(&ct.as_str()))
    else {
        record_request("http", "unsupported_media_type");
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    };

    let (channel, subtopic) = match parse_channel_path(uri.path()) {
        Ok(parsed) => parsed,
        Err(e) => {
            record_request("http", ErrorKind::Malformed.as_str());
            debug!(path = %uri.path(), error = %e, "rejecting publish");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let key = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(key_from_authorization);

    let inbound = Inbound {
        channel,
        subtopic,
        key,
        payload: body.to_vec(),
        content_type,
    };
    match adapter.publish(inbound).await {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(e) => reject(&e),
    }
}

fn reject(err: &Error) -> Response {
    let status = error_status(err);
    if status.is_server_error() {
        warn!(error = %err, %status, "publish failed");
    } else {
        debug!(error = %err, %status, "publish rejected");
    }
    status.into_response()
}

/// Publish endpoint plus the operational routes.
pub fn router(adapter: Adapter, ops: OpsState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/channels/{*rest}", post(publish_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(adapter)
        .merge(ops_router(ops))
}
