//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe proxied request outcomes
//! - Track per-destination failure bookkeeping
//! - Decide the new passive health value through a named policy
//!
//! # Design Decisions
//! - Only destination-originated failures count; client faults and
//!   cancellations never blame a destination
//! - Policies read their tuning knobs from cluster metadata
//! - Bookkeeping lives on the destination; policies are stateless

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use axum::http::StatusCode;
use tokio::time::Instant;

use crate::config::schema::names;
use crate::health::state::DestinationHealth;
use crate::proxy::error::ProxyErrorKind;
use crate::runtime::cluster::ClusterConfig;
use crate::runtime::destination::DestinationInfo;

/// Separate from the active policy's threshold key.
pub const CONSECUTIVE_FAILURES_THRESHOLD: &str = "ConsecutiveFailuresPassiveHealthPolicy.Threshold";
pub const FAILURE_RATE_LIMIT: &str = "TransportFailureRateHealthPolicy.RateLimit";
pub const FAILURE_RATE_MIN_TOTAL: &str = "TransportFailureRateHealthPolicy.MinimalTotalCountThreshold";

const DEFAULT_CONSECUTIVE_FAILURES: usize = 3;
const DEFAULT_FAILURE_RATE_LIMIT: f64 = 0.3;
const DEFAULT_FAILURE_RATE_MIN_TOTAL: usize = 10;
const FAILURE_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of one completed proxied call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub error: Option<ProxyErrorKind>,
    /// Status received from the destination, if any.
    pub status: Option<StatusCode>,
}

impl RequestOutcome {
    pub fn success(status: StatusCode) -> Self {
        Self {
            error: None,
            status: Some(status),
        }
    }

    pub fn failure(kind: ProxyErrorKind) -> Self {
        Self {
            error: Some(kind),
            status: None,
        }
    }

    /// Transport-level failure at the destination.
    pub fn is_transport_failure(&self) -> bool {
        self.error.is_some_and(|kind| kind.is_destination_failure())
    }

    /// Transport failure or a gateway-class status from the destination.
    pub fn is_failure(&self) -> bool {
        self.is_transport_failure()
            || matches!(
                self.status,
                Some(StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT)
            )
    }
}

/// Per-destination passive bookkeeping.
#[derive(Debug, Default)]
pub struct PassiveHealthTracker {
    consecutive_failures: AtomicUsize,
    history: Mutex<RequestHistory>,
}

#[derive(Debug, Default)]
struct RequestHistory {
    records: VecDeque<(Instant, bool)>,
    failed: usize,
}

impl RequestHistory {
    fn record(&mut self, now: Instant, failed: bool, window: Duration) {
        while let Some((at, was_failed)) = self.records.front().copied() {
            if now.duration_since(at) <= window {
                break;
            }
            self.records.pop_front();
            if was_failed {
                self.failed -= 1;
            }
        }
        self.records.push_back((now, failed));
        if failed {
            self.failed += 1;
        }
    }
}

impl PassiveHealthTracker {
    /// Forget everything, e.g. after reactivation.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.records.clear();
        history.failed = 0;
    }

    fn record_consecutive(&self, failed: bool) -> usize {
        if failed {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            0
        }
    }

    /// Record an outcome and return `(total, failed)` within the window.
    fn record_windowed(&self, failed: bool, window: Duration) -> (usize, usize) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.record(Instant::now(), failed, window);
        (history.records.len(), history.failed)
    }
}

/// Turns request outcomes into passive health.
pub trait PassiveHealthPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluate one completed call and return the destination's new passive health.
    fn request_proxied(
        &self,
        cluster: &ClusterConfig,
        destination: &DestinationInfo,
        outcome: &RequestOutcome,
    ) -> DestinationHealth;
}

/// Unhealthy after N consecutive failed calls.
#[derive(Debug, Default)]
pub struct ConsecutiveFailuresPassivePolicy;

impl PassiveHealthPolicy for ConsecutiveFailuresPassivePolicy {
    fn name(&self) -> &'static str {
        names::PASSIVE_CONSECUTIVE_FAILURES
    }

    fn request_proxied(
        &self,
        cluster: &ClusterConfig,
        destination: &DestinationInfo,
        outcome: &RequestOutcome,
    ) -> DestinationHealth {
        let threshold = metadata_value(cluster, CONSECUTIVE_FAILURES_THRESHOLD, DEFAULT_CONSECUTIVE_FAILURES);
        let failures = destination.passive.record_consecutive(outcome.is_failure());
        if failures == 0 {
            DestinationHealth::Healthy
        } else if failures >= threshold {
            DestinationHealth::Unhealthy
        } else {
            destination.health().passive
        }
    }
}

/// Unhealthy when the windowed transport failure rate reaches the limit.
#[derive(Debug, Default)]
pub struct TransportFailureRatePolicy;

impl PassiveHealthPolicy for TransportFailureRatePolicy {
    fn name(&self) -> &'static str {
        names::PASSIVE_TRANSPORT_FAILURE_RATE
    }

    fn request_proxied(
        &self,
        cluster: &ClusterConfig,
        destination: &DestinationInfo,
        outcome: &RequestOutcome,
    ) -> DestinationHealth {
        let limit = metadata_value(cluster, FAILURE_RATE_LIMIT, DEFAULT_FAILURE_RATE_LIMIT);
        let min_total = metadata_value(cluster, FAILURE_RATE_MIN_TOTAL, DEFAULT_FAILURE_RATE_MIN_TOTAL);

        let (total, failed) = destination
            .passive
            .record_windowed(outcome.is_transport_failure(), FAILURE_RATE_WINDOW);
        if total < min_total {
            return DestinationHealth::Healthy;
        }

        let rate = failed as f64 / total as f64;
        if rate < limit {
            DestinationHealth::Healthy
        } else {
            DestinationHealth::Unhealthy
        }
    }
}

pub(crate) fn metadata_value<T: FromStr>(cluster: &ClusterConfig, key: &str, default: T) -> T {
    cluster
        .options
        .metadata
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
