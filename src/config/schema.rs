//! Configuration schema definitions.
//!
//! Two families of types live here:
//! - the raw proxy configuration (clusters, destinations, routes) handed to the
//!   reconciler by a [`ConfigSource`](crate::config::source::ConfigSource);
//! - [`ProxySettings`], the process-level settings loaded once at startup.
//!
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Well-known policy and mode names.
pub mod names {
    pub const LB_FIRST: &str = "First";
    pub const LB_RANDOM: &str = "Random";
    pub const LB_POWER_OF_TWO_CHOICES: &str = "PowerOfTwoChoices";
    pub const LB_ROUND_ROBIN: &str = "RoundRobin";
    pub const LB_LEAST_REQUESTS: &str = "LeastRequests";

    pub const AFFINITY_COOKIE: &str = "Cookie";
    pub const AFFINITY_CUSTOM_HEADER: &str = "CustomHeader";

    pub const AFFINITY_FAILURE_REDISTRIBUTE: &str = "Redistribute";
    pub const AFFINITY_FAILURE_RETURN_503: &str = "Return503Error";

    pub const ACTIVE_CONSECUTIVE_FAILURES: &str = "ConsecutiveFailures";
    pub const ACTIVE_STATUS_CODE: &str = "StatusCode";

    pub const PASSIVE_CONSECUTIVE_FAILURES: &str = "ConsecutiveFailures";
    pub const PASSIVE_TRANSPORT_FAILURE_RATE: &str = "TransportFailureRate";
}

/// A full snapshot of the proxy configuration as supplied by a source.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RawConfig {
    /// Clusters keyed by id. The key must match [`Cluster::id`].
    pub clusters: BTreeMap<String, Cluster>,

    /// Routes in source order. Ids must be unique; later duplicates are dropped.
    pub routes: Vec<ProxyRoute>,
}

/// A logical group of equivalent destinations plus shared policy.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Cluster {
    /// Unique cluster identifier.
    pub id: String,

    /// Destinations keyed by destination id.
    pub destinations: BTreeMap<String, Destination>,

    /// Load balancing options.
    pub load_balancing: LoadBalancingOptions,

    /// Session affinity options.
    pub session_affinity: SessionAffinityOptions,

    /// Active and passive health check options.
    pub health_check: HealthCheckOptions,

    /// Outgoing request options.
    pub http_request: HttpRequestOptions,

    /// Arbitrary key/value pairs. Health policies read their tuning knobs from here.
    pub metadata: BTreeMap<String, String>,
}

/// One physical backend endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Destination {
    /// Base address requests are forwarded to (e.g., "http://10.0.0.1:8080/").
    pub address: String,

    /// Optional separate address for active health probes.
    pub health: Option<String>,

    /// Arbitrary key/value pairs.
    pub metadata: BTreeMap<String, String>,
}

/// Load balancing options for a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancingOptions {
    /// Policy name. Defaults to `PowerOfTwoChoices` when unset.
    pub mode: Option<String>,
}

impl LoadBalancingOptions {
    pub fn mode_or_default(&self) -> &str {
        self.mode
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(names::LB_POWER_OF_TWO_CHOICES)
    }
}

/// Session affinity options for a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionAffinityOptions {
    /// Enable sticky sessions.
    pub enabled: bool,

    /// Provider name (`Cookie`, `CustomHeader`). Normalized to `Cookie` when unset.
    pub mode: Option<String>,

    /// Failure policy name. Normalized to `Redistribute` when unset.
    pub failure_policy: Option<String>,

    /// Cookie or header name carrying the affinity key.
    pub affinity_key_name: Option<String>,

    /// Provider specific settings.
    pub settings: BTreeMap<String, String>,
}

/// Health check options for a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckOptions {
    /// Active (probe based) checks.
    pub active: ActiveHealthCheckOptions,

    /// Passive (request outcome based) checks.
    pub passive: PassiveHealthCheckOptions,
}

/// Active health check options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ActiveHealthCheckOptions {
    /// Enable active health checks.
    pub enabled: bool,

    /// Probe interval in milliseconds.
    pub interval_ms: Option<u64>,

    /// Per-probe timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Active health policy name.
    pub policy: Option<String>,

    /// Path appended to the probe address.
    pub path: Option<String>,
}

impl ActiveHealthCheckOptions {
    pub fn policy_or_default(&self) -> &str {
        self.policy
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(names::ACTIVE_CONSECUTIVE_FAILURES)
    }
}

/// Passive health check options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PassiveHealthCheckOptions {
    /// Enable passive health checks.
    pub enabled: bool,

    /// Passive health policy name.
    pub policy: Option<String>,

    /// Time after which an unhealthy destination is given another chance.
    pub reactivation_period_ms: Option<u64>,
}

impl PassiveHealthCheckOptions {
    pub fn policy_or_default(&self) -> &str {
        self.policy
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(names::PASSIVE_TRANSPORT_FAILURE_RATE)
    }
}

/// Outgoing request options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpRequestOptions {
    /// Overrides the global request timeout for this cluster.
    pub timeout_ms: Option<u64>,
}

/// Route configuration mapping requests to a cluster.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyRoute {
    /// Unique route identifier.
    pub route_id: String,

    /// Match criteria.
    #[serde(rename = "match")]
    pub matcher: RouteMatch,

    /// Lower values are evaluated first. Unset is treated as 0.
    pub priority: Option<i32>,

    /// Target cluster.
    pub cluster_id: Option<String>,

    /// Named authorization policy.
    pub authorization_policy: Option<String>,

    /// Named CORS policy.
    pub cors_policy: Option<String>,

    /// Arbitrary key/value pairs.
    pub metadata: BTreeMap<String, String>,

    /// Raw transform definitions, one dictionary per transform.
    pub transforms: Vec<BTreeMap<String, String>>,
}

/// Route match criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteMatch {
    /// Allowed HTTP methods. `None` matches any method.
    pub methods: Option<Vec<String>>,

    /// Host patterns (exact or `*.` wildcard prefix).
    pub hosts: Vec<String>,

    /// Path template.
    pub path: Option<String>,
}

/// Root process settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxySettings {
    /// Reconciliation loop settings.
    pub reconciliation: ReconciliationSettings,

    /// Health checking defaults and limits.
    pub health: HealthSettings,

    /// Request forwarding settings.
    pub proxy: ForwardingSettings,

    /// Observability settings.
    pub observability: ObservabilitySettings,
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReconciliationSettings {
    /// Interval between periodic passes in milliseconds.
    pub interval_ms: u64,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl ReconciliationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Health checking defaults and limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    /// Upper bound on probes in flight across all clusters.
    pub max_concurrent_probes: usize,

    /// Probe interval used when a cluster does not set one.
    pub default_probe_interval_ms: u64,

    /// Probe timeout used when a cluster does not set one.
    pub default_probe_timeout_ms: u64,

    /// Probe path used when a cluster does not set one.
    pub default_probe_path: String,

    /// Passive reactivation period used when a cluster does not set one.
    pub default_reactivation_period_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 100,
            default_probe_interval_ms: 15_000,
            default_probe_timeout_ms: 10_000,
            default_probe_path: "/api/health".to_string(),
            default_reactivation_period_ms: 60_000,
        }
    }
}

/// Request forwarding settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ForwardingSettings {
    /// Request timeout (time until response headers) in milliseconds.
    pub request_timeout_ms: u64,

    /// Buffer size of the body copy loop in bytes.
    pub stream_buffer_size: usize,
}

impl Default for ForwardingSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 100_000,
            stream_buffer_size: 81_920,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Record telemetry through the `metrics` facade.
    pub metrics_enabled: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
        }
    }
}
