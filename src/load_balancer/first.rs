//! First-eligible strategy.

use std::sync::Arc;

use crate::config::schema::names;
use crate::load_balancer::{LoadBalancingPolicy, PickContext};
use crate::runtime::destination::DestinationInfo;

/// Always the first eligible destination, in insertion order.
#[derive(Debug, Default)]
pub struct First;

impl LoadBalancingPolicy for First {
    fn name(&self) -> &'static str {
        names::LB_FIRST
    }

    fn pick(&self, _ctx: &PickContext<'_>, eligible: &[Arc<DestinationInfo>]) -> Option<Arc<DestinationInfo>> {
        eligible.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::{cluster, destinations};
    use crate::load_balancer::ThreadRandom;

    #[test]
    fn test_first() {
        let cluster = cluster();
        let ctx = PickContext {
            cluster: &cluster,
            all: &[],
            random: &ThreadRandom,
        };
        let pool = destinations(&[5, 0, 0]);
        assert_eq!(First.pick(&ctx, &pool).unwrap().id(), "d0");
    }
}
