//! Affinity failure policies.

use crate::affinity::{AffinityFailurePolicy, AffinityStatus};
use crate::config::schema::names;

/// Ignore the broken affinity and let load balancing pick a new destination.
#[derive(Debug, Default)]
pub struct Redistribute;

impl AffinityFailurePolicy for Redistribute {
    fn name(&self) -> &'static str {
        names::AFFINITY_FAILURE_REDISTRIBUTE
    }

    fn handle(&self, cluster_id: &str, status: AffinityStatus) -> bool {
        tracing::debug!(cluster_id = %cluster_id, ?status, "Affinity failed, redistributing");
        true
    }
}

/// Stop the request; the dispatcher answers 503.
#[derive(Debug, Default)]
pub struct Return503Error;

impl AffinityFailurePolicy for Return503Error {
    fn name(&self) -> &'static str {
        names::AFFINITY_FAILURE_RETURN_503
    }

    fn handle(&self, cluster_id: &str, status: AffinityStatus) -> bool {
        tracing::info!(cluster_id = %cluster_id, ?status, "Affinity failed, rejecting request");
        false
    }
}
