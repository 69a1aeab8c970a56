//! Validated config produced by a reconciliation pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::schema::{Cluster, ProxyRoute};
use crate::proxy::transforms::{TransformBuildError, Transforms};

/// A route with its match and transform data resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRoute {
    pub route_id: String,

    /// Upper-cased allowed methods. `None` matches any method.
    pub methods: Option<Vec<String>>,

    pub hosts: Vec<String>,

    pub path: Option<String>,

    pub priority: Option<i32>,

    pub cluster_id: Option<String>,

    pub authorization_policy: Option<String>,

    pub cors_policy: Option<String>,

    pub metadata: BTreeMap<String, String>,

    pub transforms: Arc<Transforms>,
}

impl ParsedRoute {
    /// Resolve a raw route. Only transform parsing can fail here; the
    /// remaining checks belong to the route validator.
    pub fn parse(route: &ProxyRoute) -> Result<Self, TransformBuildError> {
        let transforms = Transforms::build(&route.transforms)?;
        Ok(Self {
            route_id: route.route_id.clone(),
            methods: route
                .matcher
                .methods
                .as_ref()
                .map(|methods| methods.iter().map(|m| m.trim().to_ascii_uppercase()).collect()),
            hosts: route.matcher.hosts.clone(),
            path: route.matcher.path.clone(),
            priority: route.priority,
            cluster_id: route.cluster_id.clone(),
            authorization_policy: route.authorization_policy.clone(),
            cors_policy: route.cors_policy.clone(),
            metadata: route.metadata.clone(),
            transforms: Arc::new(transforms),
        })
    }

    /// Ordering key: priority ascending (unset = 0), then id.
    pub fn sort_key(&self) -> (i32, &str) {
        (self.priority.unwrap_or(0), self.route_id.as_str())
    }
}

/// Immutable output of one pass: validated clusters plus ordered routes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicConfigRoot {
    pub clusters: BTreeMap<String, Arc<Cluster>>,

    /// Sorted by [`ParsedRoute::sort_key`].
    pub routes: Vec<Arc<ParsedRoute>>,
}

impl DynamicConfigRoot {
    pub fn route_ids(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.route_id.as_str()).collect()
    }
}
