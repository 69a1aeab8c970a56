//! Health coordination.
//!
//! # Responsibilities
//! - Route request outcomes to the cluster's passive policy
//! - Apply active probing results
//! - Schedule passive reactivation for destinations marked unhealthy
//! - Recompute the cluster's healthy list whenever a destination's health moves
//!
//! # Design Decisions
//! - Reactivation runs on a run-once scheduler keyed by cluster and destination
//!   id, so re-marking an already waiting destination does not stack timers
//! - Reactivation resets passive health to Unknown, which is eligible

use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::health::active::ProbeResult;
use crate::health::passive::RequestOutcome;
use crate::health::state::DestinationHealth;
use crate::lifecycle::scheduler::{EntityAction, EntityActionScheduler};
use crate::observability::metrics::TelemetrySink;
use crate::registry::PolicyRegistries;
use crate::runtime::cluster::ClusterInfo;
use crate::runtime::destination::DestinationInfo;

#[derive(Clone)]
struct ReactivationTarget {
    cluster: Arc<ClusterInfo>,
    destination: Arc<DestinationInfo>,
}

/// Applies health policy decisions to runtime state.
pub struct HealthCoordinator {
    registries: Arc<PolicyRegistries>,
    reactivation: EntityActionScheduler<ReactivationTarget>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl HealthCoordinator {
    pub fn new(registries: Arc<PolicyRegistries>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let reactivation_telemetry = telemetry.clone();
        let action: EntityAction<ReactivationTarget> = Arc::new(move |target: ReactivationTarget| {
            let telemetry = reactivation_telemetry.clone();
            async move { reactivate(&target, telemetry.as_ref()) }.boxed()
        });
        Self {
            registries,
            reactivation: EntityActionScheduler::new(action, true, true),
            telemetry,
        }
    }

    /// Feed one completed proxied call into the cluster's passive policy.
    pub fn request_proxied(&self, cluster: &Arc<ClusterInfo>, destination: &Arc<DestinationInfo>, outcome: &RequestOutcome) {
        let config = cluster.config();
        if !config.passive_enabled() {
            return;
        }
        let policy_name = config.options.health_check.passive.policy_or_default();
        let Some(policy) = self.registries.passive_health.get(policy_name) else {
            warn!(cluster_id = %cluster.id(), policy = %policy_name, "Unknown passive health policy");
            return;
        };

        let health = policy.request_proxied(&config, destination, outcome);
        if !destination.set_passive_health(health) {
            return;
        }

        self.publish(cluster, destination);
        if health == DestinationHealth::Unhealthy {
            let key = reactivation_key(cluster.id(), destination.id());
            let scheduled = self.reactivation.schedule_entity(
                &key,
                ReactivationTarget {
                    cluster: cluster.clone(),
                    destination: destination.clone(),
                },
                config.reactivation_period,
            );
            if scheduled {
                info!(
                    cluster_id = %cluster.id(),
                    destination_id = %destination.id(),
                    reactivation_in = ?config.reactivation_period,
                    "Destination marked unhealthy by passive checks"
                );
            }
        }
    }

    /// Apply one round of probe results through the cluster's active policy.
    pub fn apply_active_results(&self, cluster: &Arc<ClusterInfo>, results: &[ProbeResult]) {
        let config = cluster.config();
        let policy_name = config.options.health_check.active.policy_or_default();
        let Some(policy) = self.registries.active_health.get(policy_name) else {
            warn!(cluster_id = %cluster.id(), policy = %policy_name, "Unknown active health policy");
            return;
        };

        let mut changed = false;
        for update in policy.probing_completed(&config, results) {
            if update.destination.set_active_health(update.health) {
                changed = true;
                debug!(
                    cluster_id = %cluster.id(),
                    destination_id = %update.destination.id(),
                    health = ?update.health,
                    "Active health changed"
                );
                self.telemetry.destination_health_changed(
                    cluster.id(),
                    update.destination.id(),
                    update.destination.health().is_eligible(config.active_enabled(), config.passive_enabled()),
                );
            }
        }
        if changed {
            cluster.update_dynamic_state();
        }
    }

    /// Cancel any pending reactivation of a removed destination.
    pub async fn forget_destination(&self, cluster_id: &str, destination_id: &str) {
        self.reactivation
            .unschedule_entity(&reactivation_key(cluster_id, destination_id))
            .await;
    }

    pub fn is_reactivation_pending(&self, cluster_id: &str, destination_id: &str) -> bool {
        self.reactivation
            .is_scheduled(&reactivation_key(cluster_id, destination_id))
    }

    /// Cancel every pending reactivation.
    pub async fn stop(&self) {
        self.reactivation.stop().await;
    }

    fn publish(&self, cluster: &ClusterInfo, destination: &DestinationInfo) {
        cluster.update_dynamic_state();
        let config = cluster.config();
        self.telemetry.destination_health_changed(
            cluster.id(),
            destination.id(),
            destination.health().is_eligible(config.active_enabled(), config.passive_enabled()),
        );
    }
}

/// Length-prefixed so ids containing the separator cannot collide.
fn reactivation_key(cluster_id: &str, destination_id: &str) -> String {
    format!("{}:{cluster_id}/{destination_id}", cluster_id.len())
}

fn reactivate(target: &ReactivationTarget, telemetry: &dyn TelemetrySink) {
    target.destination.passive.reset();
    if target.destination.set_passive_health(DestinationHealth::Unknown) {
        target.cluster.update_dynamic_state();
        let config = target.cluster.config();
        telemetry.destination_health_changed(
            target.cluster.id(),
            target.destination.id(),
            target
                .destination
                .health()
                .is_eligible(config.active_enabled(), config.passive_enabled()),
        );
        info!(
            cluster_id = %target.cluster.id(),
            destination_id = %target.destination.id(),
            "Destination reactivated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use axum::http::StatusCode;

    use crate::config::schema::{Cluster, Destination, HealthSettings, PassiveHealthCheckOptions};
    use crate::health::passive::CONSECUTIVE_FAILURES_THRESHOLD;
    use crate::observability::metrics::NullTelemetry;
    use crate::proxy::error::ProxyErrorKind;
    use crate::runtime::cluster::ClusterConfig;
    use crate::runtime::destination::DestinationConfig;

    fn cluster_with_passive() -> Arc<ClusterInfo> {
        let mut options = Cluster {
            id: "c1".into(),
            metadata: BTreeMap::from([(CONSECUTIVE_FAILURES_THRESHOLD.to_string(), "2".to_string())]),
            ..Default::default()
        };
        options.health_check.passive = PassiveHealthCheckOptions {
            enabled: true,
            policy: Some("ConsecutiveFailures".into()),
            reactivation_period_ms: Some(1_000),
        };
        let cluster = Arc::new(ClusterInfo::new(
            "c1",
            ClusterConfig::new(Arc::new(options), &HealthSettings::default()),
        ));
        for id in ["d1", "d2"] {
            let config = DestinationConfig::from_options(&Destination {
                address: "http://127.0.0.1:1/".into(),
                ..Default::default()
            })
            .unwrap();
            cluster.destinations().get_or_create(id, |id| DestinationInfo::new(id, config));
        }
        cluster.update_dynamic_state();
        cluster
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_failure_then_reactivation() {
        let coordinator = HealthCoordinator::new(Arc::new(PolicyRegistries::builtin()), Arc::new(NullTelemetry));
        let cluster = cluster_with_passive();
        let d1 = cluster.destinations().try_get("d1").unwrap();
        let failure = RequestOutcome::failure(ProxyErrorKind::UpstreamTransport);

        coordinator.request_proxied(&cluster, &d1, &failure);
        assert_eq!(cluster.dynamic_state().healthy_destinations.len(), 2);

        coordinator.request_proxied(&cluster, &d1, &failure);
        assert_eq!(d1.health().passive, DestinationHealth::Unhealthy);
        assert_eq!(cluster.dynamic_state().healthy_destinations.len(), 1);
        assert!(coordinator.is_reactivation_pending("c1", "d1"));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;

        assert_eq!(d1.health().passive, DestinationHealth::Unknown);
        assert_eq!(cluster.dynamic_state().healthy_destinations.len(), 2);
        assert!(!coordinator.is_reactivation_pending("c1", "d1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_disabled_ignores_outcomes() {
        let coordinator = HealthCoordinator::new(Arc::new(PolicyRegistries::builtin()), Arc::new(NullTelemetry));
        let cluster = Arc::new(ClusterInfo::new(
            "c2",
            ClusterConfig::new(Arc::new(Cluster::default()), &HealthSettings::default()),
        ));
        let config = DestinationConfig::from_options(&Destination {
            address: "http://127.0.0.1:1/".into(),
            ..Default::default()
        })
        .unwrap();
        let (d1, _) = cluster.destinations().get_or_create("d1", |id| DestinationInfo::new(id, config));

        for _ in 0..20 {
            coordinator.request_proxied(&cluster, &d1, &RequestOutcome::success(StatusCode::BAD_GATEWAY));
        }
        assert_eq!(d1.health().passive, DestinationHealth::Unknown);
    }

    #[test]
    fn test_reactivation_keys_do_not_collide() {
        assert_ne!(reactivation_key("a/b", "c"), reactivation_key("a", "b/c"));
        assert_ne!(reactivation_key("a:1", "b"), reactivation_key("a", "1:b"));
        assert_eq!(reactivation_key("c1", "d1"), reactivation_key("c1", "d1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_destination_cancels_reactivation() {
        let coordinator = HealthCoordinator::new(Arc::new(PolicyRegistries::builtin()), Arc::new(NullTelemetry));
        let cluster = cluster_with_passive();
        let d1 = cluster.destinations().try_get("d1").unwrap();
        let failure = RequestOutcome::failure(ProxyErrorKind::RequestTimeout);
        coordinator.request_proxied(&cluster, &d1, &failure);
        coordinator.request_proxied(&cluster, &d1, &failure);
        assert!(coordinator.is_reactivation_pending("c1", "d1"));

        coordinator.forget_destination("c1", "d1").await;
        assert!(!coordinator.is_reactivation_pending("c1", "d1"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(d1.health().passive, DestinationHealth::Unhealthy);
    }
}
