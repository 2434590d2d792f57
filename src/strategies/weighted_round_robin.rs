//! Weighted round-robin strategy — each replica appears `weight` times in
//! a virtual list that is shuffled once per rebuild and then stepped
//! through like plain round-robin.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::thread_rng;

use super::{ReplicaStrategy, SelectionContext};
use crate::endpoint::EndpointSnapshot;

struct VirtualList {
    fingerprint: Vec<(String, u32)>,
    list: Vec<String>,
    idx: usize,
}

/// Round-robins over a shuffled virtual list in which each replica appears
/// `weight` times, rebuilt whenever membership or weights change.
#[derive(Debug)]
pub struct WeightedRoundRobinStrategy {
    state: Mutex<VirtualList>,
}

impl Default for WeightedRoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRoundRobinStrategy {
    /// Construct a strategy with an empty, not-yet-built virtual list.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VirtualList {
                fingerprint: Vec::new(),
                list: Vec::new(),
                idx: 0,
            }),
        }
    }
}

fn fingerprint(healthy: &[EndpointSnapshot]) -> Vec<(String, u32)> {
    let mut fp: Vec<(String, u32)> = healthy
        .iter()
        .map(|e| (e.endpoint_id.clone(), e.weight))
        .collect();
    fp.sort();
    fp
}

impl ReplicaStrategy for WeightedRoundRobinStrategy {
    fn select(&self, healthy: &[EndpointSnapshot], _ctx: SelectionContext<'_>) -> Option<String> {
        if healthy.is_empty() {
            return None;
        }

        let current_fp = fingerprint(healthy);
        let mut state = self.state.lock();

        if state.fingerprint != current_fp || state.list.is_empty() {
            let mut list = Vec::new();
            for snapshot in healthy {
                for _ in 0..snapshot.weight.max(1) {
                    list.push(snapshot.endpoint_id.clone());
                }
            }
            list.shuffle(&mut thread_rng());
            state.fingerprint = current_fp;
            state.list = list;
            state.idx = 0;
        }

        let idx = state.idx % state.list.len();
        state.idx += 1;
        Some(state.list[idx].clone())
    }

    fn name(&self) -> &'static str {
        "weighted-round-robin"
    }
}
