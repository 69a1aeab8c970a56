//! Uniform random strategy.

use std::sync::Arc;

use crate::config::schema::names;
use crate::load_balancer::{LoadBalancingPolicy, PickContext};
use crate::runtime::destination::DestinationInfo;

#[derive(Debug, Default)]
pub struct Random;

impl LoadBalancingPolicy for Random {
    fn name(&self) -> &'static str {
        names::LB_RANDOM
    }

    fn pick(&self, ctx: &PickContext<'_>, eligible: &[Arc<DestinationInfo>]) -> Option<Arc<DestinationInfo>> {
        if eligible.is_empty() {
            return None;
        }
        eligible.get(ctx.random.next_index(eligible.len())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::{cluster, destinations};
    use crate::load_balancer::SequenceRandom;

    #[test]
    fn test_random_uses_source() {
        let cluster = cluster();
        let random = SequenceRandom::new([2, 0]);
        let ctx = PickContext {
            cluster: &cluster,
            all: &[],
            random: &random,
        };
        let pool = destinations(&[0, 0, 0]);
        assert_eq!(Random.pick(&ctx, &pool).unwrap().id(), "d2");
        assert_eq!(Random.pick(&ctx, &pool).unwrap().id(), "d0");
    }
}
