//! Round-robin load balancing strategy.

use std::sync::Arc;

use crate::config::schema::names;
use crate::load_balancer::{LoadBalancingPolicy, PickContext};
use crate::runtime::destination::DestinationInfo;

/// Round-robin selector.
/// The rotating cursor is stored on the cluster, so each cluster rotates
/// independently.
#[derive(Debug, Default)]
pub struct RoundRobin;

impl LoadBalancingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        names::LB_ROUND_ROBIN
    }

    fn pick(&self, ctx: &PickContext<'_>, eligible: &[Arc<DestinationInfo>]) -> Option<Arc<DestinationInfo>> {
        if eligible.is_empty() {
            return None;
        }
        let index = ctx.cluster.next_round_robin() % eligible.len();
        Some(eligible[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::{cluster, destinations};
    use crate::load_balancer::ThreadRandom;

    #[test]
    fn test_round_robin() {
        let cluster = cluster();
        let ctx = PickContext {
            cluster: &cluster,
            all: &[],
            random: &ThreadRandom,
        };
        let pool = destinations(&[0, 0]);

        assert_eq!(RoundRobin.pick(&ctx, &pool).unwrap().id(), "d0");
        assert_eq!(RoundRobin.pick(&ctx, &pool).unwrap().id(), "d1");
        assert_eq!(RoundRobin.pick(&ctx, &pool).unwrap().id(), "d0");
    }

    #[test]
    fn test_cursor_is_per_cluster() {
        let (a, b) = (cluster(), cluster());
        let pool = destinations(&[0, 0]);
        let ctx_a = PickContext {
            cluster: &a,
            all: &[],
            random: &ThreadRandom,
        };
        let ctx_b = PickContext {
            cluster: &b,
            all: &[],
            random: &ThreadRandom,
        };

        RoundRobin.pick(&ctx_a, &pool);
        assert_eq!(RoundRobin.pick(&ctx_b, &pool).unwrap().id(), "d0");
    }
}
