use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum::extract::{Query, State};
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::{debug, info};

use super::session::Session;
use super::table::SessionTable;
use crate::adapter::Adapter;
use crate::auth::key_from_authorization;
use crate::client::{Client, EgressQueue};
use crate::http::{OpsState, error_status, ops_router};
use crate::messaging::topic::{parse_channel_path, parse_subscribe_subtopic};
use crate::server::Shutdown;
use crate::utils::metrics::record_request;

#[derive(Clone)]
pub struct WsState {
    pub adapter: Adapter,
    pub sessions: Arc<SessionTable>,
    pub shutdown: Arc<Shutdown>,
    pub queue_depth: usize,
}

/// Query string of the upgrade request. `authorization` carries the device
/// key when no header is sent.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(default)]
    pub authorization: Option<String>,
}

fn credential(query: HandshakeQuery, headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(key_from_authorization)
        .or(query.authorization.filter(|key| !key.is_empty()))
}

async fn handshake(
    State(state): State<WsState>,
    uri: Uri,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let parsed = parse_channel_path(uri.path()).and_then(|(channel, raw)| {
        parse_subscribe_subtopic(&raw).map(|subtopic| (channel, raw, subtopic))
    });
    let (channel, raw_subtopic, subtopic) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(path = %uri.path(), error = %e, "refusing upgrade");
            record_request("ws", "malformed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let key = credential(query, &headers);
    let publisher = match state.adapter.authorize(&channel, key.as_deref()).await {
        Ok(publisher) => publisher,
        Err(e) => {
            debug!(%channel, error = %e, "refusing upgrade");
            record_request("ws", e.kind().as_str());
            return error_status(&e).into_response();
        }
    };

    let Some(guard) = state.shutdown.session() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let queue = Arc::new(EgressQueue::new(state.queue_depth, "ws"));
    let client = Client::new(channel, subtopic, publisher, queue);
    info!(client = %client.id, channel = %client.channel, "websocket session accepted");

    let session = Session {
        adapter: state.adapter.clone(),
        client,
        key: key.unwrap_or_default(),
        raw_subtopic,
        sessions: state.sessions.clone(),
        signal: state.shutdown.signal(),
        closed: AtomicBool::new(false),
        _guard: guard,
    };
    ws.on_upgrade(move |socket| session.run(socket))
}

/// Upgrade endpoint plus the operational routes.
pub fn router(state: WsState, ops: OpsState) -> Router {
    Router::new()
        .route("/channels/{*rest}", get(handshake))
        .with_state(state)
        .merge(ops_router(ops))
}
