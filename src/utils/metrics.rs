//! Prometheus metrics registry.
//!
//! The recorder is global to the process, so `init` installs it once and
//! hands out clones of the same handle afterwards.

use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const ADAPTER_REQUESTS: &str = "adapter_requests_total";
pub const BROKER_REQUESTS: &str = "broker_requests_total";
pub const BROKER_LATENCY: &str = "broker_request_duration_seconds";
pub const DROPPED_MESSAGES: &str = "dropped_messages_total";
pub const SPILL_DROPPED: &str = "spill_dropped_total";

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and return its handle.
pub fn init() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                describe();
                handle
            }
            // Another recorder is installed; render from a detached one.
            Err(_) => PrometheusBuilder::new().build_recorder().handle(),
        })
        .clone()
}

fn describe() {
    describe_counter!(
        ADAPTER_REQUESTS,
        "Ingress requests handled by a protocol adapter"
    );
    describe_counter!(BROKER_REQUESTS, "Broker operations by method and outcome");
    describe_histogram!(BROKER_LATENCY, "Broker operation latency");
    describe_counter!(
        DROPPED_MESSAGES,
        "Egress frames dropped because a subscriber queue overflowed"
    );
    describe_counter!(
        SPILL_DROPPED,
        "Events evicted from the publish spill buffer"
    );
}

/// Count one ingress request for `protocol` with the given outcome label.
pub fn record_request(protocol: &'static str, outcome: &'static str) {
    metrics::counter!(ADAPTER_REQUESTS, "protocol" => protocol, "outcome" => outcome).increment(1);
}
