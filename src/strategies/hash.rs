//! Hash strategy — deterministically maps a routing key onto one member
//! of the healthy set, stable as long as that set doesn't change.

use super::{stable_hash32, ReplicaStrategy, SelectionContext};
use crate::endpoint::EndpointSnapshot;

/// Returns `healthy[stable_hash(key) mod |healthy|]`. The same key always
/// maps to the same replica while the healthy set's membership is
/// unchanged; members are sorted by id first so the mapping doesn't depend
/// on the order snapshots happen to arrive in.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashStrategy;

impl ReplicaStrategy for HashStrategy {
    fn select(&self, healthy: &[EndpointSnapshot], ctx: SelectionContext<'_>) -> Option<String> {
        if healthy.is_empty() {
            return None;
        }
        let key = ctx.routing_key.unwrap_or("");
        let mut sorted: Vec<&EndpointSnapshot> = healthy.iter().collect();
        sorted.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        let idx = (stable_hash32(key) as usize) % sorted.len();
        Some(sorted[idx].endpoint_id.clone())
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}
