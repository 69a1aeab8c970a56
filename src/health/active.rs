//! Active health checking.
//!
//! # Responsibilities
//! - Send probes to destinations ([`ProbeClient`])
//! - Turn a round of probe results into active health ([`ActiveHealthPolicy`])

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;
use url::Url;

use crate::config::schema::names;
use crate::health::passive::metadata_value;
use crate::health::state::DestinationHealth;
use crate::runtime::cluster::ClusterConfig;
use crate::runtime::destination::DestinationInfo;

pub const CONSECUTIVE_FAILURES_THRESHOLD: &str = "ConsecutiveFailuresHealthPolicy.Threshold";
const DEFAULT_CONSECUTIVE_FAILURES: usize = 2;

/// Probe transport failure.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe request: {0}")]
    Request(String),

    #[error("probe failed: {0}")]
    Transport(String),

    #[error("probe timed out")]
    Timeout,
}

/// Sends one probe and returns the response status.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn probe(&self, uri: &Url) -> Result<StatusCode, ProbeError>;
}

/// Probe client on the hyper-util connection pool.
#[derive(Clone)]
pub struct HttpProbeClient {
    client: Client<HttpConnector, Body>,
}

impl HttpProbeClient {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HttpProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn probe(&self, uri: &Url) -> Result<StatusCode, ProbeError> {
        let request = Request::builder()
            .method("GET")
            .uri(uri.as_str())
            .header("user-agent", "reverse-proxy-core-health-probe")
            .body(Body::empty())
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        Ok(response.status())
    }
}

/// Result of probing one destination.
#[derive(Debug)]
pub struct ProbeResult {
    pub destination: Arc<DestinationInfo>,
    pub outcome: Result<StatusCode, ProbeError>,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(&self.outcome, Ok(status) if status.is_success())
    }
}

/// New active health for one destination.
#[derive(Debug, Clone)]
pub struct ActiveHealthUpdate {
    pub destination: Arc<DestinationInfo>,
    pub health: DestinationHealth,
}

/// Turns a probing round into active health.
pub trait ActiveHealthPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn probing_completed(&self, cluster: &ClusterConfig, results: &[ProbeResult]) -> Vec<ActiveHealthUpdate>;
}

/// Unhealthy after N consecutive failed probes; a single success resets.
#[derive(Debug, Default)]
pub struct ConsecutiveFailuresActivePolicy;

impl ActiveHealthPolicy for ConsecutiveFailuresActivePolicy {
    fn name(&self) -> &'static str {
        names::ACTIVE_CONSECUTIVE_FAILURES
    }

    fn probing_completed(&self, cluster: &ClusterConfig, results: &[ProbeResult]) -> Vec<ActiveHealthUpdate> {
        let threshold = metadata_value(cluster, CONSECUTIVE_FAILURES_THRESHOLD, DEFAULT_CONSECUTIVE_FAILURES);
        results
            .iter()
            .map(|result| {
                let counter = &result.destination.active_failures;
                let health = if result.is_success() {
                    counter.store(0, Ordering::Relaxed);
                    DestinationHealth::Healthy
                } else {
                    let failures = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures >= threshold {
                        DestinationHealth::Unhealthy
                    } else {
                        DestinationHealth::Healthy
                    }
                };
                ActiveHealthUpdate {
                    destination: result.destination.clone(),
                    health,
                }
            })
            .collect()
    }
}

/// Unhealthy on any non-2xx probe.
#[derive(Debug, Default)]
pub struct StatusCodePolicy;

impl ActiveHealthPolicy for StatusCodePolicy {
    fn name(&self) -> &'static str {
        names::ACTIVE_STATUS_CODE
    }

    fn probing_completed(&self, _cluster: &ClusterConfig, results: &[ProbeResult]) -> Vec<ActiveHealthUpdate> {
        results
            .iter()
            .map(|result| ActiveHealthUpdate {
                destination: result.destination.clone(),
                health: if result.is_success() {
                    DestinationHealth::Healthy
                } else {
                    DestinationHealth::Unhealthy
                },
            })
            .collect()
    }
}
