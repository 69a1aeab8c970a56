//! Reconciliation of config snapshots into the runtime registries.
//!
//! # Responsibilities
//! - Pull a snapshot from the [`ConfigSource`] and build a [`DynamicConfigRoot`]
//! - Diff clusters, their destinations and routes against the registries
//! - Keep probers and reactivation timers in step with cluster membership
//! - Drive periodic and change-triggered passes until shutdown
//!
//! # Design Decisions
//! - One pass at a time (async mutex); request handling never takes it
//! - Existing objects are updated in place so held references stay valid
//! - Identical content is never re-published
//! - A failing source leaves every registry untouched

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::builder::DynamicConfigBuilder;
use crate::config::errors::{ConfigErrors, ConfigValidationError};
use crate::config::parsed::DynamicConfigRoot;
use crate::config::schema::{Cluster, HealthSettings};
use crate::config::source::{ConfigSource, SourceError};
use crate::health::coordinator::HealthCoordinator;
use crate::health::worker::HealthProbeWorker;
use crate::runtime::cluster::{ClusterConfig, ClusterInfo};
use crate::runtime::destination::{DestinationConfig, DestinationInfo};
use crate::runtime::route::{RouteConfig, RouteInfo};
use crate::runtime::{ClusterManager, RouteManager};

/// Hard failure of a pass. Runtime state is unchanged.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    SourceUnavailable(#[from] SourceError),
}

/// What one pass did.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// False when the source reported no change and nothing was applied.
    pub applied: bool,
    pub errors: Vec<ConfigValidationError>,
    pub clusters_added: usize,
    pub clusters_updated: usize,
    pub clusters_removed: usize,
    pub routes_added: usize,
    pub routes_updated: usize,
    pub routes_removed: usize,
}

/// Owns the reconciliation pass.
pub struct ProxyConfigManager {
    source: Arc<dyn ConfigSource>,
    builder: DynamicConfigBuilder,
    clusters: Arc<ClusterManager>,
    routes: Arc<RouteManager>,
    coordinator: Arc<HealthCoordinator>,
    worker: Arc<HealthProbeWorker>,
    health_settings: HealthSettings,
    interval: Duration,
    pass_lock: Mutex<()>,
    current: ArcSwapOption<DynamicConfigRoot>,
}

impl ProxyConfigManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn ConfigSource>,
        builder: DynamicConfigBuilder,
        clusters: Arc<ClusterManager>,
        routes: Arc<RouteManager>,
        coordinator: Arc<HealthCoordinator>,
        worker: Arc<HealthProbeWorker>,
        health_settings: HealthSettings,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            builder,
            clusters,
            routes,
            coordinator,
            worker,
            health_settings,
            interval,
            pass_lock: Mutex::new(()),
            current: ArcSwapOption::empty(),
        }
    }

    /// The last applied snapshot.
    pub fn current_config(&self) -> Option<Arc<DynamicConfigRoot>> {
        self.current.load_full()
    }

    /// Runtime routes in evaluation order (priority, then id).
    pub fn ordered_routes(&self) -> Vec<Arc<RouteInfo>> {
        let Some(root) = self.current_config() else {
            return Vec::new();
        };
        root.routes
            .iter()
            .filter_map(|route| self.routes.try_get(&route.route_id))
            .collect()
    }

    /// Run one reconciliation pass.
    pub async fn apply_configuration(&self) -> Result<ApplyReport, ReconcileError> {
        let _pass = self.pass_lock.lock().await;

        let raw = match self.source.get_config().await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("Config source reported no change");
                return Ok(ApplyReport::default());
            }
            Err(e) => {
                error!(error = %e, "Config source unavailable, keeping current configuration");
                return Err(e.into());
            }
        };

        let mut errors = ConfigErrors::new();
        let root = self.builder.build(raw, &mut errors);
        for e in errors.iter() {
            error!(kind = %e.kind, id = %e.id, code = ?e.code, message = %e.message, "Config validation error");
        }

        let mut report = ApplyReport {
            applied: true,
            ..Default::default()
        };
        self.apply_clusters(&root, &mut report).await;
        self.apply_routes(&root, &mut report);
        self.current.store(Some(Arc::new(root)));

        report.errors = errors.into_vec();
        info!(
            clusters_added = report.clusters_added,
            clusters_updated = report.clusters_updated,
            clusters_removed = report.clusters_removed,
            routes_added = report.routes_added,
            routes_updated = report.routes_updated,
            routes_removed = report.routes_removed,
            errors = report.errors.len(),
            "Configuration applied"
        );
        Ok(report)
    }

    async fn apply_clusters(&self, root: &DynamicConfigRoot, report: &mut ApplyReport) {
        let mut current = Vec::with_capacity(root.clusters.len());

        for (id, options) in &root.clusters {
            let config = ClusterConfig::new(options.clone(), &self.health_settings);
            let (cluster, created) = self
                .clusters
                .get_or_create(id, |id| ClusterInfo::new(id, config.clone()));

            let removed = self.apply_destinations(&cluster, options);
            let membership_changed = created || removed.changed;
            let config_changed = !created && cluster.update_config(config);
            if membership_changed && !config_changed {
                cluster.bump_revision();
            }
            if membership_changed || config_changed {
                cluster.update_dynamic_state();
            }

            for destination_id in &removed.ids {
                self.coordinator.forget_destination(id, destination_id).await;
            }

            if created {
                report.clusters_added += 1;
                info!(cluster_id = %id, "Cluster added");
            } else if membership_changed || config_changed {
                report.clusters_updated += 1;
                debug!(cluster_id = %id, "Cluster updated");
            }
            current.push(cluster);
        }

        self.worker.update_clusters(&current).await;

        for id in self.clusters.ids() {
            if root.clusters.contains_key(&id) {
                continue;
            }
            self.worker.remove_cluster(&id).await;
            if let Some(cluster) = self.clusters.try_remove(&id) {
                for destination_id in cluster.destinations().ids() {
                    self.coordinator.forget_destination(&id, &destination_id).await;
                }
                report.clusters_removed += 1;
                info!(cluster_id = %id, "Cluster removed");
            }
        }
    }

    fn apply_destinations(&self, cluster: &ClusterInfo, options: &Cluster) -> DestinationChanges {
        let mut changes = DestinationChanges::default();

        for (id, destination) in &options.destinations {
            let config = match DestinationConfig::from_options(destination) {
                Ok(config) => config,
                Err(e) => {
                    warn!(cluster_id = %cluster.id(), destination_id = %id, error = %e, "Skipping destination");
                    continue;
                }
            };
            let (existing, created) = cluster
                .destinations()
                .get_or_create(id, |id| DestinationInfo::new(id, config.clone()));
            if created {
                changes.changed = true;
            } else {
                existing.update_config(config);
            }
        }

        let wanted: BTreeSet<&str> = options.destinations.keys().map(String::as_str).collect();
        for id in cluster.destinations().ids() {
            if !wanted.contains(id.as_str()) && cluster.destinations().try_remove(&id).is_some() {
                changes.changed = true;
                changes.ids.push(id);
            }
        }
        changes
    }

    fn apply_routes(&self, root: &DynamicConfigRoot, report: &mut ApplyReport) {
        for route in &root.routes {
            let cluster = route.cluster_id.as_deref().and_then(|id| self.clusters.try_get(id));
            if cluster.is_none() {
                warn!(route_id = %route.route_id, cluster_id = ?route.cluster_id, "Route has no matching cluster");
            }

            let (info, created) = self.routes.get_or_create(&route.route_id, |id| RouteInfo::new(id));
            let stale = info
                .config()
                .map_or(true, |config| config.has_changed(route, cluster.as_ref()));
            if !stale {
                continue;
            }
            info.set_config(RouteConfig::new(route.clone(), cluster));
            if created {
                report.routes_added += 1;
            } else {
                report.routes_updated += 1;
            }
        }

        let wanted: BTreeSet<&str> = root.routes.iter().map(|r| r.route_id.as_str()).collect();
        for id in self.routes.ids() {
            if !wanted.contains(id.as_str()) && self.routes.try_remove(&id).is_some() {
                report.routes_removed += 1;
                debug!(route_id = %id, "Route removed");
            }
        }
    }

    /// Run passes on the interval and on source change notifications until
    /// shutdown fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?self.interval, "Reconciliation loop starting");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.source.changed() => {
                    debug!("Config source signalled a change");
                }
                _ = shutdown.recv() => {
                    info!("Reconciliation loop received shutdown signal, exiting loop");
                    break;
                }
            }
            // Errors are logged inside the pass.
            let _ = self.apply_configuration().await;
        }
    }
}

#[derive(Debug, Default)]
struct DestinationChanges {
    changed: bool,
    ids: Vec<String>,
}
