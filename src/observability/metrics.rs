//! Telemetry sink.
//!
//! # Responsibilities
//! - Define the write-only telemetry contract used by the request path and
//!   the health coordinator
//! - Record through the `metrics` facade; exporting is up to the host
//!
//! # Metrics
//! - `proxy_stream_bytes_total` (counter): bytes copied by direction
//! - `proxy_stream_iops_total` (counter): read operations by direction
//! - `proxy_requests_total` (counter): completed requests by status class
//! - `proxy_request_duration_seconds` (histogram): request latency
//! - `proxy_destination_health` (gauge): 1=eligible, 0=excluded
//!
//! # Design Decisions
//! - Labels for cluster, route, destination, protocol
//! - A no-op sink for embedders that do not want metrics

use std::time::Duration;

use axum::http::StatusCode;
use metrics::Label;

/// Labels attached to request and stream telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyTags {
    pub cluster_id: String,
    pub route_id: String,
    pub destination_id: String,
    pub protocol: String,
}

/// Direction of a body copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Request,
    Response,
}

impl StreamDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamDirection::Request => "request",
            StreamDirection::Response => "response",
        }
    }
}

/// Write-only telemetry contract.
pub trait TelemetrySink: Send + Sync {
    fn stream_copied(&self, tags: &ProxyTags, direction: StreamDirection, bytes: u64, iops: u64);

    fn request_completed(&self, tags: &ProxyTags, status: StatusCode, duration: Duration);

    fn destination_health_changed(&self, cluster_id: &str, destination_id: &str, eligible: bool);
}

/// Records into the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTelemetry;

impl TelemetrySink for MetricsTelemetry {
    fn stream_copied(&self, tags: &ProxyTags, direction: StreamDirection, bytes: u64, iops: u64) {
        let labels = vec![
            Label::new("cluster", tags.cluster_id.clone()),
            Label::new("route", tags.route_id.clone()),
            Label::new("destination", tags.destination_id.clone()),
            Label::new("protocol", tags.protocol.clone()),
            Label::new("direction", direction.as_str()),
        ];
        metrics::counter!("proxy_stream_bytes_total", labels.clone()).increment(bytes);
        metrics::counter!("proxy_stream_iops_total", labels).increment(iops);
    }

    fn request_completed(&self, tags: &ProxyTags, status: StatusCode, duration: Duration) {
        let class = format!("{}xx", status.as_u16() / 100);
        metrics::counter!(
            "proxy_requests_total",
            "cluster" => tags.cluster_id.clone(),
            "route" => tags.route_id.clone(),
            "status_class" => class
        )
        .increment(1);
        metrics::histogram!(
            "proxy_request_duration_seconds",
            "cluster" => tags.cluster_id.clone(),
            "route" => tags.route_id.clone()
        )
        .record(duration.as_secs_f64());
    }

    fn destination_health_changed(&self, cluster_id: &str, destination_id: &str, eligible: bool) {
        metrics::gauge!(
            "proxy_destination_health",
            "cluster" => cluster_id.to_string(),
            "destination" => destination_id.to_string()
        )
        .set(if eligible { 1.0 } else { 0.0 });
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn stream_copied(&self, _tags: &ProxyTags, _direction: StreamDirection, _bytes: u64, _iops: u64) {}

    fn request_completed(&self, _tags: &ProxyTags, _status: StatusCode, _duration: Duration) {}

    fn destination_health_changed(&self, _cluster_id: &str, _destination_id: &str, _eligible: bool) {}
}
