//! Prometheus metrics
//!
//! Metric names and the duration bucket layout are fixed for compatibility
//! with existing dashboards. Recording goes through the `metrics` facade;
//! the HTTP front-end installs a Prometheus recorder and renders the text
//! exposition on `/metrics`. Without a recorder installed (stdio-only
//! runs, unit tests) every call here is a no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const TOOL_CALLS_TOTAL: &str = "mcp_router_tool_calls_total";
pub const TOOL_CALL_DURATION_SECONDS: &str = "mcp_router_tool_call_duration_seconds";
pub const UPSTREAM_CIRCUIT_STATE: &str = "mcp_router_upstream_circuit_state";
pub const UPSTREAM_CIRCUIT_OPENS_TOTAL: &str = "mcp_router_upstream_circuit_opens_total";
pub const UPSTREAM_FAILURES_TOTAL: &str = "mcp_router_upstream_failures_total";
pub const UPSTREAM_HEALTH: &str = "mcp_router_upstream_health";
pub const UPSTREAM_HEALTH_CHECKS_TOTAL: &str = "mcp_router_upstream_health_checks_total";

const DURATION_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0];

const CIRCUIT_STATES: &[&str] = &["closed", "open", "half_open"];
const HEALTH_STATUSES: &[&str] = &["unknown", "healthy", "unhealthy"];

/// Install the Prometheus recorder and return the handle the `/metrics`
/// endpoint renders from. Call once per process.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(TOOL_CALL_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!(TOOL_CALLS_TOTAL, "Tool calls forwarded through the router");
    describe_histogram!(
        TOOL_CALL_DURATION_SECONDS,
        "Duration of forwarded tool calls in seconds"
    );
    describe_gauge!(
        UPSTREAM_CIRCUIT_STATE,
        "Circuit breaker state per upstream (1 for the active state)"
    );
    describe_counter!(
        UPSTREAM_CIRCUIT_OPENS_TOTAL,
        "Circuit breaker open transitions per upstream"
    );
    describe_counter!(
        UPSTREAM_FAILURES_TOTAL,
        "Transport-level upstream failures"
    );
    describe_gauge!(
        UPSTREAM_HEALTH,
        "Health status per upstream (1 for the active status)"
    );
    describe_counter!(
        UPSTREAM_HEALTH_CHECKS_TOTAL,
        "Health probes per upstream by outcome"
    );
}

pub fn record_tool_call(server: &str, tool: &str, ok: bool, duration: Duration) {
    let ok_label = if ok { "true" } else { "false" };
    counter!(
        TOOL_CALLS_TOTAL,
        "server" => server.to_string(),
        "tool" => tool.to_string(),
        "ok" => ok_label,
    )
    .increment(1);
    histogram!(
        TOOL_CALL_DURATION_SECONDS,
        "server" => server.to_string(),
        "tool" => tool.to_string(),
        "ok" => ok_label,
    )
    .record(duration.as_secs_f64());
}

/// Mark the active circuit state for an upstream; the other states drop to
/// zero so dashboards can sum the family.
pub fn set_circuit_state(server: &str, state: &str) {
    for candidate in CIRCUIT_STATES {
        let value = if *candidate == state { 1.0 } else { 0.0 };
        gauge!(
            UPSTREAM_CIRCUIT_STATE,
            "server" => server.to_string(),
            "state" => *candidate,
        )
        .set(value);
    }
}

pub fn record_circuit_open(server: &str) {
    counter!(UPSTREAM_CIRCUIT_OPENS_TOTAL, "server" => server.to_string()).increment(1);
}

pub fn record_upstream_failure(server: &str) {
    counter!(UPSTREAM_FAILURES_TOTAL, "server" => server.to_string()).increment(1);
}

pub fn set_health_status(server: &str, status: &str) {
    for candidate in HEALTH_STATUSES {
        let value = if *candidate == status { 1.0 } else { 0.0 };
        gauge!(
            UPSTREAM_HEALTH,
            "server" => server.to_string(),
            "status" => *candidate,
        )
        .set(value);
    }
}

pub fn record_health_check(server: &str, ok: bool) {
    counter!(
        UPSTREAM_HEALTH_CHECKS_TOTAL,
        "server" => server.to_string(),
        "ok" => if ok { "true" } else { "false" },
    )
    .increment(1);
}
