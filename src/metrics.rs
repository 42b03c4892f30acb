//! Metrics recorder and metric descriptions
//!
//! Counters, gauges, and histograms are emitted through the `metrics`
//! facade at their call sites; this module installs the Prometheus
//! recorder and serves as the registry of what exists. The scrape surface
//! is the REST `/metrics` endpoint.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{ControlError, Result};

/// Install the process-wide recorder and return the scrape handle.
pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ControlError::Internal(format!("metrics recorder: {e}")))?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!(
        "fleetplane_requests_total",
        "REST requests by method, route class, and status"
    );
    describe_counter!("fleetplane_request_errors_total", "REST requests that returned an error");
    describe_counter!(
        "fleetplane_auth_outcomes_total",
        "Login and token verification outcomes"
    );
    describe_counter!("fleetplane_discovery_pushes_total", "Discovery responses pushed");
    describe_counter!("fleetplane_discovery_acks_total", "Acks received from subscribers");
    describe_counter!("fleetplane_discovery_nacks_total", "Nacks received from subscribers");
    describe_counter!(
        "fleetplane_discovery_auth_failures_total",
        "Streams rejected at authentication"
    );
    describe_counter!(
        "fleetplane_discovery_overload_total",
        "Streams rejected by the per-cluster limit"
    );
    describe_counter!("fleetplane_license_cache_hits_total", "License verdicts served from cache");
    describe_counter!(
        "fleetplane_license_fetch_failures_total",
        "License validation fetch failures"
    );
    describe_counter!(
        "fleetplane_license_stale_verdicts_total",
        "Verdicts served from the grace window"
    );
    describe_counter!("fleetplane_license_denials_total", "License admission denials by reason");
    describe_counter!("fleetplane_snapshot_builds_total", "Snapshot rebuilds");
    describe_counter!("fleetplane_certificates_issued_total", "Certificates issued");

    describe_gauge!("fleetplane_discovery_streams", "Active discovery streams per cluster");
    describe_gauge!(
        "fleetplane_discovery_lagging_subscriptions",
        "Subscriptions whose last ack trails the pushed version"
    );
    describe_gauge!("fleetplane_known_proxies", "Known proxy registrations per cluster");
    describe_gauge!("fleetplane_snapshot_resources", "Resources in the current snapshot per cluster");

    describe_histogram!("fleetplane_request_seconds", "REST request latency");
    describe_histogram!("fleetplane_discovery_push_seconds", "Discovery push latency");
}
