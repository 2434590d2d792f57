//! Geographic strategy — prefers replicas tagged with the caller's region,
//! falling back to least-response-time globally when no regional match
//! exists.

use super::{LeastResponseTimeStrategy, ReplicaStrategy, SelectionContext};
use crate::endpoint::EndpointSnapshot;

/// If a preferred region is supplied and at least one healthy replica
/// carries that tag, picks the lowest-latency replica among those;
/// otherwise delegates to [`LeastResponseTimeStrategy`].
#[derive(Debug, Default)]
pub struct GeographicStrategy {
    fallback: LeastResponseTimeStrategy,
}

impl GeographicStrategy {
    /// Construct a geographic strategy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaStrategy for GeographicStrategy {
    fn select(&self, healthy: &[EndpointSnapshot], ctx: SelectionContext<'_>) -> Option<String> {
        if let Some(region) = ctx.preferred_region {
            let regional: Vec<&EndpointSnapshot> = healthy
                .iter()
                .filter(|e| e.region.as_deref() == Some(region))
                .collect();
            if let Some(best) = regional
                .iter()
                .min_by(|a, b| a.ewma_latency_ms.total_cmp(&b.ewma_latency_ms))
            {
                return Some(best.endpoint_id.clone());
            }
        }
        self.fallback.select(healthy, ctx)
    }

    fn name(&self) -> &'static str {
        "geographic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, region: Option<&str>, latency: f64) -> EndpointSnapshot {
        EndpointSnapshot {
            endpoint_id: id.into(),
            healthy: true,
            region: region.map(String::from),
            weight: 1,
            request_count: 0,
            error_count: 0,
            ewma_latency_ms: latency,
            active: 0,
            idle: 1,
            waiters: 0,
        }
    }

    #[test]
    fn prefers_matching_region() {
        let strategy = GeographicStrategy::new();
        let healthy = vec![
            snapshot("us-slow", Some("us"), 100.0),
            snapshot("eu-fast", Some("eu"), 5.0),
        ];
        let ctx = SelectionContext {
            routing_key: None,
            preferred_region: Some("us"),
        };
        assert_eq!(strategy.select(&healthy, ctx).unwrap(), "us-slow");
    }

    #[test]
    fn falls_back_to_least_response_time_without_regional_match() {
        let strategy = GeographicStrategy::new();
        let healthy = vec![
            snapshot("eu-slow", Some("eu"), 100.0),
            snapshot("eu-fast", Some("eu"), 5.0),
        ];
        let ctx = SelectionContext {
            routing_key: None,
            preferred_region: Some("ap"),
        };
        assert_eq!(strategy.select(&healthy, ctx).unwrap(), "eu-fast");
    }

    #[test]
    fn falls_back_when_no_region_requested() {
        let strategy = GeographicStrategy::new();
        let healthy = vec![snapshot("a", None, 50.0), snapshot("b", None, 10.0)];
        let ctx = SelectionContext::default();
        assert_eq!(strategy.select(&healthy, ctx).unwrap(), "b");
    }
}
