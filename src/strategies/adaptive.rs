//! Adaptive strategy — periodically inspects the healthy set's latency and
//! load variance and switches its inner delegate accordingly.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    LeastConnectionsStrategy, LeastResponseTimeStrategy, ReplicaStrategy, RoundRobinStrategy,
    SelectionContext, WeightedRoundRobinStrategy,
};
use crate::endpoint::EndpointSnapshot;

/// Minimum gap between re-evaluations of which delegate to use.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Variance-over-mean ratio above which latency or load is considered
/// "high variance" for delegate-switching purposes.
const VARIANCE_THRESHOLD: f64 = 0.5;

struct Delegate {
    last_tick: Instant,
    strategy: Box<dyn ReplicaStrategy>,
}

/// Delegates selection to round-robin, least-connections,
/// least-response-time, or weighted-round-robin, re-evaluating which one
/// fits best on a fixed cadence rather than on every call.
pub struct AdaptiveStrategy {
    delegate: Mutex<Delegate>,
}

impl std::fmt::Debug for AdaptiveStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveStrategy").finish_non_exhaustive()
    }
}

impl Default for AdaptiveStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveStrategy {
    /// Construct an adaptive strategy starting on round-robin.
    pub fn new() -> Self {
        Self {
            delegate: Mutex::new(Delegate {
                last_tick: Instant::now() - TICK_INTERVAL,
                strategy: Box::new(RoundRobinStrategy::new()),
            }),
        }
    }

    fn reevaluate(healthy: &[EndpointSnapshot]) -> Box<dyn ReplicaStrategy> {
        let latencies: Vec<f64> = healthy.iter().map(|e| e.ewma_latency_ms).collect();
        let loads: Vec<f64> = healthy.iter().map(|e| e.request_count as f64).collect();
        let mixed_weights = healthy.iter().any(|e| e.weight != 1)
            && healthy.iter().map(|e| e.weight).collect::<std::collections::HashSet<_>>().len() > 1;

        if coefficient_of_variation(&latencies) > VARIANCE_THRESHOLD {
            Box::new(LeastResponseTimeStrategy)
        } else if coefficient_of_variation(&loads) > VARIANCE_THRESHOLD {
            Box::new(LeastConnectionsStrategy)
        } else if mixed_weights {
            Box::new(WeightedRoundRobinStrategy::new())
        } else {
            Box::new(RoundRobinStrategy::new())
        }
    }
}

fn coefficient_of_variation(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    if mean <= f64::EPSILON {
        return 0.0;
    }
    let variance =
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt() / mean
}

impl ReplicaStrategy for AdaptiveStrategy {
    fn select(&self, healthy: &[EndpointSnapshot], ctx: SelectionContext<'_>) -> Option<String> {
        if healthy.is_empty() {
            return None;
        }

        let mut delegate = self.delegate.lock();
        if delegate.last_tick.elapsed() >= TICK_INTERVAL {
            delegate.strategy = Self::reevaluate(healthy);
            delegate.last_tick = Instant::now();
        }
        delegate.strategy.select(healthy, ctx)
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}
