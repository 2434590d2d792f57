//! Round-robin strategy — cycles through the healthy set evenly.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{membership_fingerprint, ReplicaStrategy, SelectionContext};
use crate::endpoint::EndpointSnapshot;

/// Cycles through the healthy replica set in order.
///
/// The counter resets whenever the healthy set's membership changes, so a
/// newly recovered (or newly added) replica isn't skipped indefinitely by
/// a stale modulus.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
    last_membership: Mutex<Vec<String>>,
}

impl RoundRobinStrategy {
    /// Construct a fresh round-robin cursor.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaStrategy for RoundRobinStrategy {
    fn select(&self, healthy: &[EndpointSnapshot], _ctx: SelectionContext<'_>) -> Option<String> {
        if healthy.is_empty() {
            return None;
        }

        let fingerprint = membership_fingerprint(healthy);
        {
            let mut last = self.last_membership.lock();
            if *last != fingerprint {
                *last = fingerprint;
                self.counter.store(0, Ordering::Relaxed);
            }
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].endpoint_id.clone())
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}
