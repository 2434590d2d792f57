//! Load balancer strategies for replica selection.
//!
//! Each strategy is a (mostly) pure function of the current healthy-replica
//! snapshot plus any strategy-local state (a round-robin cursor, a shuffled
//! weighted list, ...). The `ReplicaStrategy` trait is the same shape the
//! crate's connection-pool selection layer used before this router existed:
//! one `select` entry point plus a `name()` for logging, generalized here
//! to the snapshot-and-key contract the load balancer needs.

mod adaptive;
mod geographic;
mod hash;
mod least_connections;
mod least_response_time;
mod random;
mod round_robin;
mod weighted_round_robin;

pub use adaptive::AdaptiveStrategy;
pub use geographic::GeographicStrategy;
pub use hash::HashStrategy;
pub use least_connections::LeastConnectionsStrategy;
pub use least_response_time::LeastResponseTimeStrategy;
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use weighted_round_robin::WeightedRoundRobinStrategy;

use std::fmt;

use crate::endpoint::EndpointSnapshot;

/// Per-call context a strategy may use to bias its pick.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectionContext<'a> {
    /// Caller-supplied stable key, consumed only by [`HashStrategy`].
    pub routing_key: Option<&'a str>,
    /// Caller-preferred region, consumed only by [`GeographicStrategy`].
    pub preferred_region: Option<&'a str>,
}

/// Selects one replica endpoint id from the currently healthy set.
///
/// Implementations must be cheap (O(|replicas|)) and must return `None`
/// when `healthy` is empty rather than falling back to an unhealthy
/// endpoint — the caller (the Router, via the Load Balancer) is
/// responsible for deciding what "no replica" means for the request.
pub trait ReplicaStrategy: Send + Sync + fmt::Debug {
    /// Pick one endpoint id out of `healthy`, or `None` if it is empty.
    fn select(&self, healthy: &[EndpointSnapshot], ctx: SelectionContext<'_>) -> Option<String>;

    /// Name of this strategy, for logging and the `matched_strategy` field
    /// recorded on every `RoutingDecision`.
    fn name(&self) -> &'static str;
}

/// Which strategy a `LoadBalancerConfig` selects, by enumerated name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    /// Cycle through the healthy set in order.
    RoundRobin,
    /// Round-robin over a virtual list where each replica appears `weight`
    /// times.
    WeightedRoundRobin,
    /// Pick the healthy replica with the fewest total requests served.
    LeastConnections,
    /// Pick the healthy replica with the lowest EWMA latency.
    LeastResponseTime,
    /// Uniform random pick from the healthy set.
    Random,
    /// Prefer replicas tagged with the caller's region; fall back to
    /// least-response-time globally.
    Geographic,
    /// Deterministic pick keyed by a caller-supplied routing key.
    Hash,
    /// Periodically re-evaluates healthy-set variance and delegates to
    /// whichever of the above strategies fits best.
    Adaptive,
}

/// Build the concrete strategy a `StrategyKind` names.
pub fn build_strategy(kind: StrategyKind) -> Box<dyn ReplicaStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new()),
        StrategyKind::WeightedRoundRobin => Box::new(WeightedRoundRobinStrategy::new()),
        StrategyKind::LeastConnections => Box::new(LeastConnectionsStrategy),
        StrategyKind::LeastResponseTime => Box::new(LeastResponseTimeStrategy),
        StrategyKind::Random => Box::new(RandomStrategy),
        StrategyKind::Geographic => Box::new(GeographicStrategy::new()),
        StrategyKind::Hash => Box::new(HashStrategy),
        StrategyKind::Adaptive => Box::new(AdaptiveStrategy::new()),
    }
}

/// Stable 32-bit FNV-1a hash of a string, used by [`HashStrategy`] instead
/// of `DefaultHasher` so the mapping is explicitly documented and doesn't
/// depend on std's hasher internals.
pub(crate) fn stable_hash32(key: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x01000193;
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Fingerprint of the current healthy set's membership (ids only), used by
/// strategies that must detect when to reset a cursor or rebuild a cached
/// virtual list.
pub(crate) fn membership_fingerprint(healthy: &[EndpointSnapshot]) -> Vec<String> {
    let mut ids: Vec<String> = healthy.iter().map(|e| e.endpoint_id.clone()).collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash32("tenant-42"), stable_hash32("tenant-42"));
        assert_ne!(stable_hash32("tenant-42"), stable_hash32("tenant-43"));
    }
}
