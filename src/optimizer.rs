//! Pool Optimizer: background worker that resizes every pool within its
//! configured bounds based on observed utilization.
//!
//! Grounded on the teacher's single-purpose background-task shape (a
//! `tokio::spawn`-ed loop woken by `tokio::time::interval`, the same pattern
//! `HealthMonitor::spawn` uses), applied here to pool sizing instead of
//! health probing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::driver::Driver;
use crate::metrics::SharedMetrics;
use crate::pool::EndpointPool;

/// Optimizer thresholds and cadence.
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    /// Whether the optimizer runs at all.
    pub enabled: bool,
    /// Cadence of each scaling decision round.
    pub check_interval: Duration,
    /// Utilization at/above which a pool's max is raised.
    pub scale_up_threshold: f64,
    /// Utilization at/below which a pool's max is lowered.
    pub scale_down_threshold: f64,
    /// How much to raise `max_size` by per scale-up decision.
    pub scale_up_step: u32,
    /// How much to lower `max_size` by per scale-down decision.
    pub scale_down_step: u32,
    /// Floor no pool's max may be scaled down below.
    pub configured_min: u32,
    /// Ceiling no pool's max may be scaled up beyond.
    pub configured_max: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_step: 2,
            scale_down_step: 1,
            configured_min: 2,
            configured_max: 25,
        }
    }
}

/// Background worker that periodically resizes the pools it was built
/// over, based on `active / current_size` utilization.
pub struct PoolOptimizer<D: Driver> {
    pools: Vec<Arc<EndpointPool<D>>>,
    config: OptimizerConfig,
    metrics: SharedMetrics,
}

impl<D: Driver> PoolOptimizer<D> {
    /// Construct an optimizer over the given pools (typically primary plus
    /// every replica).
    pub fn new(pools: Vec<Arc<EndpointPool<D>>>, config: OptimizerConfig, metrics: SharedMetrics) -> Self {
        Self { pools, config, metrics }
    }

    /// Run one scaling round across every pool.
    pub async fn tick(&self) {
        for pool in &self.pools {
            self.consider_resize(pool).await;
        }
    }

    async fn consider_resize(&self, pool: &Arc<EndpointPool<D>>) {
        let snapshot = pool.snapshot(true).await;
        let current_size = snapshot.active + snapshot.idle;
        if current_size == 0 {
            return;
        }
        let utilization = snapshot.active as f64 / current_size as f64;
        let current_max = pool.max_size();
        let min_size = pool.min_size();

        if utilization >= self.config.scale_up_threshold && current_max < self.config.configured_max {
            let new_max = (current_max + self.config.scale_up_step).min(self.config.configured_max);
            if new_max != current_max {
                info!(
                    endpoint = %pool.endpoint().id,
                    utilization,
                    old_max = current_max,
                    new_max,
                    "optimizer scaling pool up"
                );
                pool.resize(min_size, new_max).await;
            }
        } else if utilization <= self.config.scale_down_threshold && current_max > self.config.configured_min {
            let new_max = current_max
                .saturating_sub(self.config.scale_down_step)
                .max(self.config.configured_min);
            if new_max != current_max {
                info!(
                    endpoint = %pool.endpoint().id,
                    utilization,
                    old_max = current_max,
                    new_max,
                    "optimizer scaling pool down"
                );
                pool.resize(min_size, new_max).await;
            }
        }
    }

    /// Spawn the optimizer's background loop, observing `shutdown` the same
    /// way `HealthMonitor::spawn` does. A no-op loop is still spawned when
    /// `enabled` is false, so callers don't need to special-case disabled
    /// optimizers at the call site; it just never ticks.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()>
    where
        D: 'static,
    {
        tokio::spawn(async move {
            if !self.config.enabled {
                let _ = shutdown.changed().await;
                return;
            }
            let mut ticker = tokio::time::interval(self.config.check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
