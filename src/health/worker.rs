//! Active probing worker.
//!
//! # Responsibilities
//! - Keep one periodic prober per cluster with active checks enabled
//! - Probe every destination of the cluster, bounded by a global limit
//! - Hand each round's results to the [`HealthCoordinator`]
//!
//! # Design Decisions
//! - Probers are scheduled on [`EntityActionScheduler`], one entity per cluster
//! - Destination membership is read at probe time, so adding or removing
//!   destinations never restarts a prober
//! - A change to the probe interval, timeout, path, policy or metadata restarts it

use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::time;
use url::Url;

use crate::health::active::{ProbeClient, ProbeError, ProbeResult};
use crate::health::coordinator::HealthCoordinator;
use crate::lifecycle::scheduler::{EntityAction, EntityActionScheduler};
use crate::runtime::cluster::{ClusterConfig, ClusterInfo};
use crate::runtime::destination::DestinationInfo;

#[derive(Clone)]
struct ProbeTarget {
    cluster: Arc<ClusterInfo>,
    config: Arc<ClusterConfig>,
}

/// Schedules active probing per cluster.
pub struct HealthProbeWorker {
    scheduler: EntityActionScheduler<ProbeTarget>,
}

impl HealthProbeWorker {
    pub fn new(max_concurrent_probes: usize, client: Arc<dyn ProbeClient>, coordinator: Arc<HealthCoordinator>) -> Self {
        let limiter = Arc::new(Semaphore::new(max_concurrent_probes.max(1)));
        let action: EntityAction<ProbeTarget> = Arc::new(move |target: ProbeTarget| {
            let client = client.clone();
            let limiter = limiter.clone();
            let coordinator = coordinator.clone();
            async move {
                let results = probe_cluster(&target.cluster, client.as_ref(), &limiter).await;
                coordinator.apply_active_results(&target.cluster, &results);
            }
            .boxed()
        });
        Self {
            scheduler: EntityActionScheduler::new(action, true, false),
        }
    }

    /// Align probers with the clusters' current active check settings.
    pub async fn update_clusters(&self, clusters: &[Arc<ClusterInfo>]) {
        for cluster in clusters {
            let config = cluster.config();
            let id = cluster.id();

            if !config.active_enabled() {
                if self.scheduler.unschedule_entity(id).await {
                    tracing::info!(cluster_id = %id, "Active health probing stopped");
                }
                continue;
            }

            if let Some(existing) = self.scheduler.get(id) {
                if !probe_settings_changed(&existing.config, &config) {
                    continue;
                }
                self.scheduler.unschedule_entity(id).await;
            }

            let interval = config.probe_interval;
            let target = ProbeTarget {
                cluster: cluster.clone(),
                config,
            };
            if self.scheduler.schedule_entity(id, target, interval) {
                tracing::info!(cluster_id = %id, interval = ?interval, "Active health probing scheduled");
            }
        }
    }

    /// Stop probing a cluster. No probe round for it starts after this returns.
    pub async fn remove_cluster(&self, cluster_id: &str) {
        self.scheduler.unschedule_entity(cluster_id).await;
    }

    pub fn is_probing(&self, cluster_id: &str) -> bool {
        self.scheduler.is_scheduled(cluster_id)
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }
}

fn probe_settings_changed(old: &ClusterConfig, new: &ClusterConfig) -> bool {
    old.probe_interval != new.probe_interval
        || old.probe_timeout != new.probe_timeout
        || old.probe_path != new.probe_path
        || old.options.health_check.active != new.options.health_check.active
        || old.options.metadata != new.options.metadata
}

async fn probe_cluster(cluster: &ClusterInfo, client: &dyn ProbeClient, limiter: &Semaphore) -> Vec<ProbeResult> {
    let config = cluster.config();
    let destinations = cluster.dynamic_state().all_destinations.clone();
    join_all(
        destinations
            .into_iter()
            .map(|destination| probe_destination(cluster.id(), &config, destination, client, limiter)),
    )
    .await
}

async fn probe_destination(
    cluster_id: &str,
    config: &ClusterConfig,
    destination: Arc<DestinationInfo>,
    client: &dyn ProbeClient,
    limiter: &Semaphore,
) -> ProbeResult {
    let Ok(_permit) = limiter.acquire().await else {
        return ProbeResult {
            destination,
            outcome: Err(ProbeError::Request("probe limiter closed".into())),
        };
    };

    let uri = probe_uri(destination.config().probe_base(), &config.probe_path);
    let outcome = match time::timeout(config.probe_timeout, client.probe(&uri)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProbeError::Timeout),
    };

    match &outcome {
        Ok(status) if !status.is_success() => {
            tracing::warn!(cluster_id = %cluster_id, destination_id = %destination.id(), status = %status, "Health probe failed: non-success status");
        }
        Err(e) => {
            tracing::warn!(cluster_id = %cluster_id, destination_id = %destination.id(), error = %e, "Health probe failed");
        }
        Ok(_) => {}
    }

    ProbeResult { destination, outcome }
}

/// Append `path` to the base address path.
pub(crate) fn probe_uri(base: &Url, path: &str) -> Url {
    let mut uri = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    uri.set_path(&joined);
    uri
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::StatusCode;

    use crate::config::schema::{ActiveHealthCheckOptions, Cluster, Destination, HealthSettings};
    use crate::health::state::DestinationHealth;
    use crate::observability::metrics::NullTelemetry;
    use crate::registry::PolicyRegistries;
    use crate::runtime::destination::DestinationConfig;

    #[derive(Default)]
    struct ScriptedProbes {
        statuses: Mutex<HashMap<u16, StatusCode>>,
        probed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProbeClient for ScriptedProbes {
        async fn probe(&self, uri: &Url) -> Result<StatusCode, ProbeError> {
            self.probed.lock().unwrap().push(uri.to_string());
            let port = uri.port().unwrap_or(80);
            match self.statuses.lock().unwrap().get(&port) {
                Some(status) => Ok(*status),
                None => Err(ProbeError::Transport("connection refused".into())),
            }
        }
    }

    fn active_cluster(interval_ms: u64) -> Arc<ClusterInfo> {
        let mut options = Cluster {
            id: "c1".into(),
            ..Default::default()
        };
        options.health_check.active = ActiveHealthCheckOptions {
            enabled: true,
            interval_ms: Some(interval_ms),
            timeout_ms: Some(50),
            policy: Some("StatusCode".into()),
            path: Some("/healthz".into()),
        };
        let cluster = Arc::new(ClusterInfo::new(
            "c1",
            ClusterConfig::new(Arc::new(options), &HealthSettings::default()),
        ));
        for (id, port) in [("d1", 7001), ("d2", 7002)] {
            let config = DestinationConfig::from_options(&Destination {
                address: format!("http://127.0.0.1:{port}/base/"),
                ..Default::default()
            })
            .unwrap();
            cluster.destinations().get_or_create(id, |id| DestinationInfo::new(id, config));
        }
        cluster.update_dynamic_state();
        cluster
    }

    fn worker(client: Arc<ScriptedProbes>) -> HealthProbeWorker {
        let coordinator = Arc::new(HealthCoordinator::new(
            Arc::new(PolicyRegistries::builtin()),
            Arc::new(NullTelemetry),
        ));
        HealthProbeWorker::new(4, client, coordinator)
    }

    #[test]
    fn test_probe_uri_joins_paths() {
        let base = Url::parse("http://10.0.0.1:8080/api/").unwrap();
        assert_eq!(probe_uri(&base, "/health").as_str(), "http://10.0.0.1:8080/api/health");
        let root = Url::parse("http://10.0.0.1:8080").unwrap();
        assert_eq!(probe_uri(&root, "/health").as_str(), "http://10.0.0.1:8080/health");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_round_marks_failing_destination() {
        let client = Arc::new(ScriptedProbes::default());
        client.statuses.lock().unwrap().insert(7001, StatusCode::OK);
        let worker = worker(client.clone());
        let cluster = active_cluster(100);

        worker.update_clusters(&[cluster.clone()]).await;
        assert!(worker.is_probing("c1"));

        time::sleep(Duration::from_millis(150)).await;

        let d1 = cluster.destinations().try_get("d1").unwrap();
        let d2 = cluster.destinations().try_get("d2").unwrap();
        assert_eq!(d1.health().active, DestinationHealth::Healthy);
        assert_eq!(d2.health().active, DestinationHealth::Unhealthy);
        let healthy: Vec<_> = cluster
            .dynamic_state()
            .healthy_destinations
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(healthy, vec!["d1"]);
        assert!(client
            .probed
            .lock()
            .unwrap()
            .contains(&"http://127.0.0.1:7001/base/healthz".to_string()));

        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_active_checks_stops_prober() {
        let client = Arc::new(ScriptedProbes::default());
        let worker = worker(client.clone());
        let cluster = active_cluster(100);
        worker.update_clusters(&[cluster.clone()]).await;
        assert!(worker.is_probing("c1"));

        let mut options = (*cluster.config().options).clone();
        options.health_check.active.enabled = false;
        cluster.update_config(ClusterConfig::new(Arc::new(options), &HealthSettings::default()));
        worker.update_clusters(&[cluster.clone()]).await;
        assert!(!worker.is_probing("c1"));

        time::sleep(Duration::from_millis(500)).await;
        assert!(client.probed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_restarts_prober() {
        let client = Arc::new(ScriptedProbes::default());
        let worker = worker(client);
        let cluster = active_cluster(100);
        worker.update_clusters(&[cluster.clone()]).await;

        let mut options = (*cluster.config().options).clone();
        options.health_check.active.interval_ms = Some(250);
        cluster.update_config(ClusterConfig::new(Arc::new(options), &HealthSettings::default()));
        worker.update_clusters(&[cluster.clone()]).await;

        let target = worker.scheduler.get("c1").unwrap();
        assert_eq!(target.config.probe_interval, Duration::from_millis(250));
        worker.remove_cluster("c1").await;
        assert!(!worker.is_probing("c1"));
    }
}
