use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::server::Signal;

/// Shared by the operational endpoints of every adapter.
#[derive(Clone)]
pub struct OpsState {
    pub instance_id: Arc<str>,
    pub metrics: PrometheusHandle,
}

impl OpsState {
    pub fn new(instance_id: impl Into<Arc<str>>, metrics: PrometheusHandle) -> Self {
        Self {
            instance_id: instance_id.into(),
            metrics,
        }
    }
}

#[derive(Serialize)]
struct Health<'a> {
    status: &'static str,
    version: &'static str,
    instance_id: &'a str,
}

async fn health_handler(State(state): State<OpsState>) -> Response {
    let body = Health {
        status: "pass",
        version: env!("CARGO_PKG_VERSION"),
        instance_id: &state.instance_id,
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// Prometheus exposition.
async fn metrics_handler(State(state): State<OpsState>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}

pub fn ops_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve `app` until shutdown is signalled.
pub async fn serve(listener: TcpListener, app: Router, mut signal: Signal) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP listener started");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await
}
