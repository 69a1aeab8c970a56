//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher (affinity did not resolve a destination)
//!     → LoadBalancer::pick_destination(cluster, all, eligible, mode)
//!     → registry lookup by mode name
//!     → Apply policy:
//!         - first.rs (first eligible)
//!         - random.rs (uniform)
//!         - power_of_two.rs (two samples, fewer in-flight wins)
//!         - round_robin.rs (cluster-scoped cursor)
//!         - least_requests.rs (full scan for fewest in-flight)
//!     → Return destination, none, or SelectionError
//! ```
//!
//! # Design Decisions
//! - Policies are stateless; per-cluster state (round-robin cursor) lives on
//!   the cluster
//! - Counters are read with relaxed atomic loads
//! - Unknown mode names fail at selection time, never silently defaulted

pub mod first;
pub mod least_requests;
pub mod power_of_two;
pub mod random;
pub mod random_source;
pub mod round_robin;

use std::sync::Arc;

use crate::proxy::error::SelectionError;
use crate::registry::NamedRegistry;
use crate::runtime::cluster::ClusterInfo;
use crate::runtime::destination::DestinationInfo;

pub use random_source::{RandomSource, SequenceRandom, ThreadRandom};

/// Inputs available to a policy beyond the candidate list.
pub struct PickContext<'a> {
    pub cluster: &'a ClusterInfo,
    /// Every destination of the cluster, eligible or not.
    pub all: &'a [Arc<DestinationInfo>],
    pub random: &'a dyn RandomSource,
}

/// A named selection algorithm.
pub trait LoadBalancingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Choose among `eligible`, which is never empty.
    fn pick(&self, ctx: &PickContext<'_>, eligible: &[Arc<DestinationInfo>]) -> Option<Arc<DestinationInfo>>;
}

/// Resolves a mode name and runs the policy.
pub struct LoadBalancer {
    policies: Arc<NamedRegistry<dyn LoadBalancingPolicy>>,
    random: Arc<dyn RandomSource>,
}

impl LoadBalancer {
    pub fn new(policies: Arc<NamedRegistry<dyn LoadBalancingPolicy>>, random: Arc<dyn RandomSource>) -> Self {
        Self { policies, random }
    }

    /// Select a destination from `eligible` using the policy named `mode`.
    pub fn pick_destination(
        &self,
        cluster: &ClusterInfo,
        all: &[Arc<DestinationInfo>],
        eligible: &[Arc<DestinationInfo>],
        mode: &str,
    ) -> Result<Option<Arc<DestinationInfo>>, SelectionError> {
        let policy = self
            .policies
            .get(mode)
            .ok_or_else(|| SelectionError::UnsupportedLoadBalancingMode(mode.to_string()))?;

        match eligible.len() {
            0 => Ok(None),
            1 => Ok(Some(eligible[0].clone())),
            _ => {
                let ctx = PickContext {
                    cluster,
                    all,
                    random: self.random.as_ref(),
                };
                Ok(policy.pick(&ctx, eligible))
            }
        }
    }
}

/// Registry with every built-in policy.
pub fn builtin_policies() -> NamedRegistry<dyn LoadBalancingPolicy> {
    let mut registry: NamedRegistry<dyn LoadBalancingPolicy> = NamedRegistry::new("load balancing policy");
    let policies: [Arc<dyn LoadBalancingPolicy>; 5] = [
        Arc::new(first::First),
        Arc::new(random::Random),
        Arc::new(power_of_two::PowerOfTwoChoices),
        Arc::new(round_robin::RoundRobin),
        Arc::new(least_requests::LeastRequests),
    ];
    for policy in policies {
        registry.register(policy.name(), policy);
    }
    registry
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::config::schema::{Cluster, Destination, HealthSettings};
    use crate::runtime::cluster::{ClusterConfig, ClusterInfo};
    use crate::runtime::destination::{DestinationConfig, DestinationInfo};

    pub fn cluster() -> ClusterInfo {
        ClusterInfo::new(
            "c1",
            ClusterConfig::new(Arc::new(Cluster::default()), &HealthSettings::default()),
        )
    }

    /// Destinations `d0..dN` with the given in-flight counts.
    pub fn destinations(counts: &[usize]) -> Vec<Arc<DestinationInfo>> {
        counts
            .iter()
            .enumerate()
            .map(|(i, count)| {
                let config = DestinationConfig::from_options(&Destination {
                    address: format!("http://127.0.0.1:{}/", 9000 + i),
                    ..Default::default()
                })
                .unwrap();
                let destination = Arc::new(DestinationInfo::new(format!("d{i}"), config));
                for _ in 0..*count {
                    destination.inc_requests();
                }
                destination
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::config::schema::names;

    fn balancer() -> LoadBalancer {
        LoadBalancer::new(Arc::new(builtin_policies()), Arc::new(ThreadRandom))
    }

    #[test]
    fn test_unsupported_mode_is_an_error() {
        let err = balancer()
            .pick_destination(&cluster(), &[], &destinations(&[0, 0]), "-1")
            .unwrap_err();
        assert_eq!(err.to_string(), "Load balancing mode '-1' is not supported.");
    }

    #[test]
    fn test_empty_and_single() {
        let lb = balancer();
        assert!(lb.pick_destination(&cluster(), &[], &[], names::LB_RANDOM).unwrap().is_none());

        let single = destinations(&[3]);
        let picked = lb.pick_destination(&cluster(), &single, &single, names::LB_LEAST_REQUESTS).unwrap().unwrap();
        assert_eq!(picked.id(), "d0");
    }

    #[test]
    fn test_mode_lookup_is_case_insensitive() {
        let picked = balancer()
            .pick_destination(&cluster(), &[], &destinations(&[0, 0]), "first")
            .unwrap()
            .unwrap();
        assert_eq!(picked.id(), "d0");
    }
}
