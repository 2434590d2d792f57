//! Least-response-time strategy — picks the healthy replica with the
//! lowest EWMA latency.

use super::{ReplicaStrategy, SelectionContext};
use crate::endpoint::EndpointSnapshot;

/// Stateless: a pure function of the current snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastResponseTimeStrategy;

impl ReplicaStrategy for LeastResponseTimeStrategy {
    fn select(&self, healthy: &[EndpointSnapshot], _ctx: SelectionContext<'_>) -> Option<String> {
        healthy
            .iter()
            .min_by(|a, b| a.ewma_latency_ms.total_cmp(&b.ewma_latency_ms))
            .map(|e| e.endpoint_id.clone())
    }

    fn name(&self) -> &'static str {
        "least-response-time"
    }
}
