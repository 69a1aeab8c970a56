//! Least requests load balancing strategy.

use std::sync::Arc;

use crate::config::schema::names;
use crate::load_balancer::{LoadBalancingPolicy, PickContext};
use crate::runtime::destination::DestinationInfo;

/// Selects the destination with the fewest requests in flight.
#[derive(Debug, Default)]
pub struct LeastRequests;

impl LoadBalancingPolicy for LeastRequests {
    fn name(&self) -> &'static str {
        names::LB_LEAST_REQUESTS
    }

    fn pick(&self, _ctx: &PickContext<'_>, eligible: &[Arc<DestinationInfo>]) -> Option<Arc<DestinationInfo>> {
        // In case of tie, the first one is selected (stability)
        eligible
            .iter()
            .min_by_key(|d| d.concurrent_requests())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::{cluster, destinations};
    use crate::load_balancer::ThreadRandom;

    #[test]
    fn test_least_requests() {
        let cluster = cluster();
        let ctx = PickContext {
            cluster: &cluster,
            all: &[],
            random: &ThreadRandom,
        };
        let pool = destinations(&[1, 0, 0]);

        // Should pick d1 (first with 0 requests)
        assert_eq!(LeastRequests.pick(&ctx, &pool).unwrap().id(), "d1");

        pool[1].inc_requests();
        pool[1].inc_requests();
        assert_eq!(LeastRequests.pick(&ctx, &pool).unwrap().id(), "d2");
    }
}
