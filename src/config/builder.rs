//! Raw config → [`DynamicConfigRoot`].
//!
//! # Data Flow
//! ```text
//! RawConfig
//!     → per cluster: filters (isolated) → id check → affinity normalization
//!       → policy name checks → destination address checks
//!     → per route: duplicate check → filters (isolated) → parse → validate
//!     → sort routes by (priority, id)
//!     → DynamicConfigRoot
//! ```
//!
//! # Design Decisions
//! - Every failure is scoped to one resource and reported, never propagated
//! - A filter panic is treated like a filter error
//! - Unknown session affinity names are reported but the cluster is kept;
//!   selection fails for requests that reach it

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use url::Url;

use crate::config::errors::{ConfigErrorCode, ConfigErrors, ConfigValidationError};
use crate::config::filter::{run_isolated, ProxyConfigFilter};
use crate::config::parsed::{DynamicConfigRoot, ParsedRoute};
use crate::config::route_validator::{PolicyLookup, RouteValidator};
use crate::config::schema::{names, Cluster, RawConfig};
use crate::registry::PolicyRegistries;

/// Builds validated config snapshots.
pub struct DynamicConfigBuilder {
    filters: Vec<Arc<dyn ProxyConfigFilter>>,
    route_validator: RouteValidator,
    registries: Arc<PolicyRegistries>,
}

impl DynamicConfigBuilder {
    pub fn new(
        filters: Vec<Arc<dyn ProxyConfigFilter>>,
        policies: Arc<dyn PolicyLookup>,
        registries: Arc<PolicyRegistries>,
    ) -> Self {
        Self {
            filters,
            route_validator: RouteValidator::new(policies),
            registries,
        }
    }

    /// Validate, filter and order `raw`. Dropped resources are reported to `errors`.
    pub fn build(&self, raw: RawConfig, errors: &mut ConfigErrors) -> DynamicConfigRoot {
        let mut clusters = BTreeMap::new();
        for (key, cluster) in raw.clusters {
            if let Some(cluster) = self.build_cluster(&key, cluster, errors) {
                clusters.insert(key, Arc::new(cluster));
            }
        }

        let mut routes = Vec::with_capacity(raw.routes.len());
        let mut seen = HashSet::new();
        for mut route in raw.routes {
            let mut filtered = true;
            for filter in &self.filters {
                if let Err(message) = run_isolated(|| filter.configure_route(&mut route)) {
                    errors.report(ConfigValidationError::route(
                        &route.route_id,
                        ConfigErrorCode::RouteFilterFailed,
                        format!("Route filter failed: {message}"),
                    ));
                    filtered = false;
                    break;
                }
            }
            if !filtered {
                continue;
            }
            // Ids are unique after filtering.
            if !route.route_id.is_empty() && !seen.insert(route.route_id.clone()) {
                errors.report(ConfigValidationError::route(
                    &route.route_id,
                    ConfigErrorCode::DuplicateRouteId,
                    format!("Duplicate route '{}'", route.route_id),
                ));
                continue;
            }

            let parsed = match ParsedRoute::parse(&route) {
                Ok(parsed) => parsed,
                Err(e) => {
                    errors.report(ConfigValidationError::route(
                        &route.route_id,
                        ConfigErrorCode::RouteInvalidTransform,
                        format!("Invalid transform: {e}"),
                    ));
                    continue;
                }
            };

            if self.route_validator.validate_route(&parsed, errors) {
                routes.push(Arc::new(parsed));
            }
        }

        routes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        DynamicConfigRoot { clusters, routes }
    }

    fn build_cluster(&self, key: &str, mut cluster: Cluster, errors: &mut ConfigErrors) -> Option<Cluster> {
        for filter in &self.filters {
            if let Err(message) = run_isolated(|| filter.configure_cluster(&mut cluster)) {
                errors.report(ConfigValidationError::cluster(
                    key,
                    ConfigErrorCode::ClusterFilterFailed,
                    format!("Cluster filter failed: {message}"),
                ));
                return None;
            }
        }

        if cluster.id != key {
            errors.report(ConfigValidationError::cluster(
                key,
                ConfigErrorCode::ClusterIdMismatch,
                format!("The cluster Id '{}' and its lookup key '{key}' do not match.", cluster.id),
            ));
            return None;
        }

        self.normalize_session_affinity(&mut cluster, errors);

        let mode = cluster.load_balancing.mode_or_default();
        if !self.registries.load_balancing.contains(mode) {
            errors.report(ConfigValidationError::cluster(
                key,
                ConfigErrorCode::UnknownLoadBalancingMode,
                format!("No matching load balancing policy found for mode '{mode}'."),
            ));
            return None;
        }

        let active = &cluster.health_check.active;
        if active.enabled && !self.registries.active_health.contains(active.policy_or_default()) {
            errors.report(ConfigValidationError::cluster(
                key,
                ConfigErrorCode::UnknownActiveHealthPolicy,
                format!("No matching active health policy found for '{}'.", active.policy_or_default()),
            ));
            return None;
        }

        let passive = &cluster.health_check.passive;
        if passive.enabled && !self.registries.passive_health.contains(passive.policy_or_default()) {
            errors.report(ConfigValidationError::cluster(
                key,
                ConfigErrorCode::UnknownPassiveHealthPolicy,
                format!("No matching passive health policy found for '{}'.", passive.policy_or_default()),
            ));
            return None;
        }

        cluster.destinations.retain(|destination_id, destination| {
            let bad = std::iter::once(Some(destination.address.as_str()))
                .chain(std::iter::once(destination.health.as_deref()))
                .flatten()
                .find(|address| !is_valid_address(address));
            match bad {
                Some(address) => {
                    errors.report(ConfigValidationError::cluster(
                        key,
                        ConfigErrorCode::InvalidDestinationAddress,
                        format!("Destination '{destination_id}' has invalid address '{address}'."),
                    ));
                    false
                }
                None => true,
            }
        });

        Some(cluster)
    }

    fn normalize_session_affinity(&self, cluster: &mut Cluster, errors: &mut ConfigErrors) {
        let affinity = &mut cluster.session_affinity;
        if !affinity.enabled {
            return;
        }

        let mode = affinity
            .mode
            .get_or_insert_with(|| names::AFFINITY_COOKIE.to_string());
        if mode.is_empty() {
            *mode = names::AFFINITY_COOKIE.to_string();
        }
        if !self.registries.affinity_providers.contains(mode) {
            errors.report(ConfigValidationError::cluster(
                &cluster.id,
                ConfigErrorCode::NoSessionAffinityProviderFound,
                format!("No matching session affinity provider found for mode '{mode}'."),
            ));
        }

        let policy = affinity
            .failure_policy
            .get_or_insert_with(|| names::AFFINITY_FAILURE_REDISTRIBUTE.to_string());
        if policy.is_empty() {
            *policy = names::AFFINITY_FAILURE_REDISTRIBUTE.to_string();
        }
        if !self.registries.affinity_failure_policies.contains(policy) {
            errors.report(ConfigValidationError::cluster(
                &cluster.id,
                ConfigErrorCode::NoAffinityFailurePolicyFound,
                format!("No matching affinity failure policy found for '{policy}'."),
            ));
        }
    }
}

fn is_valid_address(address: &str) -> bool {
    Url::parse(address)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}
