//! Runtime route.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::parsed::ParsedRoute;
use crate::proxy::transforms::Transforms;
use crate::runtime::cluster::ClusterInfo;

/// Everything the dispatcher needs for one route.
#[derive(Debug)]
pub struct RouteConfig {
    pub route: Arc<ParsedRoute>,
    /// Resolved target cluster. `None` when the route's cluster does not exist.
    pub cluster: Option<Arc<ClusterInfo>>,
    pub transforms: Arc<Transforms>,
    /// Cluster revision observed when this config was built.
    pub cluster_revision: u64,
}

impl RouteConfig {
    pub fn new(route: Arc<ParsedRoute>, cluster: Option<Arc<ClusterInfo>>) -> Self {
        Self {
            cluster_revision: cluster.as_ref().map_or(0, |c| c.revision()),
            transforms: route.transforms.clone(),
            route,
            cluster,
        }
    }

    /// True when this config no longer reflects `route` and `cluster`.
    pub fn has_changed(&self, route: &ParsedRoute, cluster: Option<&Arc<ClusterInfo>>) -> bool {
        if *self.route != *route {
            return true;
        }
        match (&self.cluster, cluster) {
            (None, None) => false,
            (Some(current), Some(next)) => {
                !Arc::ptr_eq(current, next) || current.revision() != self.cluster_revision
            }
            _ => true,
        }
    }
}

/// A long-lived route object.
#[derive(Debug)]
pub struct RouteInfo {
    id: String,
    config: ArcSwapOption<RouteConfig>,
}

impl RouteInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: ArcSwapOption::empty(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> Option<Arc<RouteConfig>> {
        self.config.load_full()
    }

    pub(crate) fn set_config(&self, config: RouteConfig) {
        self.config.store(Some(Arc::new(config)));
    }
}
