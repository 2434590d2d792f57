//! Health Monitor: periodically probes every endpoint and maintains the
//! `healthy` bit via single-success-recovery / N-failure hysteresis.
//!
//! Grounded on the teacher's `start_health_check`/`check_health` polling
//! loop, generalized to probe every endpoint each tick (not just ones
//! already marked unhealthy) as the spec requires, and to apply hysteresis
//! through `EndpointState` rather than flipping the bit on the first
//! failure or success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::driver::Driver;
use crate::endpoint::EndpointState;
use crate::metrics::SharedMetrics;
use crate::pool::EndpointPool;

/// Health monitor configuration.
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Cadence at which every endpoint is probed.
    pub health_check_interval: Duration,
    /// Per-probe budget; a probe that doesn't complete within this counts
    /// as a failure.
    pub probe_timeout: Duration,
    /// Consecutive failures required before an endpoint is marked
    /// unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

/// One endpoint's pool plus its health state, as tracked by the monitor.
pub struct MonitoredEndpoint<D: Driver> {
    /// Endpoint id, matching `Endpoint::id` and `EndpointSnapshot::endpoint_id`.
    pub id: String,
    /// The endpoint's pool, probed via `health_probe`.
    pub pool: Arc<EndpointPool<D>>,
    /// Hysteresis state for this endpoint.
    pub state: Arc<EndpointState>,
}

/// Background worker that probes every endpoint on a fixed cadence,
/// parallel across endpoints and serial per endpoint (each endpoint has
/// only one probe in flight at a time because `tick` awaits the whole
/// batch before scheduling the next one).
pub struct HealthMonitor<D: Driver> {
    endpoints: Vec<MonitoredEndpoint<D>>,
    config: HealthConfig,
    metrics: SharedMetrics,
}

impl<D: Driver> HealthMonitor<D> {
    /// Construct a monitor over the given endpoints.
    pub fn new(endpoints: Vec<MonitoredEndpoint<D>>, config: HealthConfig, metrics: SharedMetrics) -> Self {
        Self {
            endpoints,
            config,
            metrics,
        }
    }

    /// Run one probe round across every endpoint, in parallel.
    pub async fn tick(&self) {
        let probes = self.endpoints.iter().map(|ep| self.probe_one(ep));
        join_all(probes).await;
    }

    async fn probe_one(&self, ep: &MonitoredEndpoint<D>) {
        let result = ep.pool.health_probe(self.config.probe_timeout).await;
        match result {
            Ok(()) => {
                if ep.state.record_success() {
                    info!(endpoint = %ep.id, "endpoint recovered");
                    self.metrics.record_endpoint_recovered(ep.id.clone());
                }
            }
            Err(e) => {
                if ep.state.record_failure() {
                    warn!(
                        endpoint = %ep.id,
                        consecutive_failures = ep.state.consecutive_failures(),
                        error = %e,
                        "endpoint failed"
                    );
                    self.metrics
                        .record_endpoint_failed(ep.id.clone(), ep.state.consecutive_failures());
                }
            }
        }
    }

    /// Current healthy/unhealthy bit for every monitored endpoint, as a
    /// cheap, lock-minimal snapshot for the Load Balancer.
    pub fn health_snapshot(&self) -> HashMap<String, bool> {
        self.endpoints
            .iter()
            .map(|ep| (ep.id.clone(), ep.state.is_healthy()))
            .collect()
    }

    /// Spawn the monitor's background loop. The loop observes `shutdown`
    /// and returns within one iteration of it firing, per the spec's
    /// cooperative-cancellation contract for background workers.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()>
    where
        D: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.health_check_interval);
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
