//! Power-of-two-choices strategy.

use std::sync::Arc;

use crate::config::schema::names;
use crate::load_balancer::{LoadBalancingPolicy, PickContext};
use crate::runtime::destination::DestinationInfo;

/// Draws two samples (with replacement) and keeps the one with fewer
/// requests in flight. Ties go to the first sample.
#[derive(Debug, Default)]
pub struct PowerOfTwoChoices;

impl LoadBalancingPolicy for PowerOfTwoChoices {
    fn name(&self) -> &'static str {
        names::LB_POWER_OF_TWO_CHOICES
    }

    fn pick(&self, ctx: &PickContext<'_>, eligible: &[Arc<DestinationInfo>]) -> Option<Arc<DestinationInfo>> {
        if eligible.is_empty() {
            return None;
        }

        let first = &eligible[ctx.random.next_index(eligible.len())];
        let second = &eligible[ctx.random.next_index(eligible.len())];

        if first.concurrent_requests() <= second.concurrent_requests() {
            Some(first.clone())
        } else {
            Some(second.clone())
        }
    }
}
