//! Random strategy — uniform pick from the healthy set.

use rand::Rng;

use super::{ReplicaStrategy, SelectionContext};
use crate::endpoint::EndpointSnapshot;

/// Stateless: draws one index uniformly from the healthy set on each call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

impl ReplicaStrategy for RandomStrategy {
    fn select(&self, healthy: &[EndpointSnapshot], _ctx: SelectionContext<'_>) -> Option<String> {
        if healthy.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..healthy.len());
        Some(healthy[idx].endpoint_id.clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
