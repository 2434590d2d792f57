//! Query Facade: the thin public adapter applications embed, wiring
//! together the registry, pools, health monitor, optimizer, and router and
//! exposing `exec`/`stream`/`transaction`/`stats`/`shutdown`.
//!
//! Grounded on the teacher's top-level `RpcPool`/`TieredPool` surface: one
//! struct owns every background task it spawns and exposes a cooperative
//! `shutdown`, generalized here to compose the Router underneath instead of
//! calling straight through to a single selection strategy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::classifier::QueryKind;
use crate::driver::{Driver, QueryOutcome, Row};
use crate::endpoint::{ConnectAddress, EndpointSnapshot, EndpointState};
use crate::error::RouterError;
use crate::health::{HealthConfig, HealthMonitor, MonitoredEndpoint};
use crate::metrics::{MetricsSink, PerformanceSummary, SharedMetrics};
use crate::optimizer::{OptimizerConfig, PoolOptimizer};
use crate::pool::{EndpointPool, PoolConfig};
use crate::registry::{EndpointRegistry, ReplicaConfig};
use crate::router::{QueryOptions, ReplicaHandle, Router, RouterConfig, TransactionHandle};
use crate::strategies::{build_strategy, StrategyKind};

/// Endpoint topology: one required primary address plus parallel lists of
/// replica addresses, regions, and weights.
#[derive(Clone, Debug, Default)]
pub struct EndpointsConfig {
    /// Address of the required primary endpoint.
    pub primary_address: ConnectAddress,
    /// Addresses of every replica, in registration order.
    pub replica_addresses: Vec<ConnectAddress>,
    /// Region tag per replica (parallel to `replica_addresses`).
    pub replica_regions: Vec<Option<String>>,
    /// Weight per replica (parallel to `replica_addresses`).
    pub replica_weights: Vec<u32>,
}

/// Load-balancer selection configuration.
#[derive(Clone, Debug)]
pub struct LoadBalancerConfig {
    /// Which strategy to build.
    pub strategy: StrategyKind,
    /// Default preferred region applied to requests that don't specify one
    /// themselves.
    pub user_region: Option<String>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Adaptive,
            user_region: None,
        }
    }
}

/// Metrics Sink sizing.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Rolling retention window for recorded queries.
    pub window: Duration,
    /// Duration at/above which a query counts as slow.
    pub slow_threshold: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            slow_threshold: Duration::from_millis(100),
        }
    }
}

/// Top-level configuration composing every component's knobs, following the
/// teacher's builder-friendly nested-config idiom.
#[derive(Clone, Debug, Default)]
pub struct FacadeConfig {
    /// Endpoint topology.
    pub endpoints: EndpointsConfig,
    /// Per-endpoint pool bounds and timeouts (applied uniformly to every
    /// endpoint; per-endpoint overrides are an unimplemented extension, see
    /// Open Questions).
    pub pool: PoolConfig,
    /// Health monitor cadence and thresholds.
    pub health: HealthConfig,
    /// Load balancer strategy selection.
    pub load_balancer: LoadBalancerConfig,
    /// Router defaults.
    pub router: RouterConfig,
    /// Pool optimizer thresholds.
    pub optimizer: OptimizerConfig,
    /// Metrics sink sizing.
    pub metrics: MetricsConfig,
}

/// Per-endpoint pool stats plus router/load-balancer level aggregates,
/// returned by [`QueryFacade::stats`].
#[derive(Clone, Debug)]
pub struct FacadeStats {
    /// Latest snapshot for every endpoint, keyed by endpoint id.
    pub pool_stats_by_endpoint: HashMap<String, EndpointSnapshot>,
    /// Aggregate query performance over the metrics window.
    pub router_stats: PerformanceSummary,
    /// Name of the strategy the load balancer is currently using.
    pub load_balancer_strategy: &'static str,
}

/// The process-facing entry point: owns every pool, the router, and the
/// background health/optimizer tasks, and exposes the public query surface.
///
/// Applications construct one `Arc<QueryFacade<D>>` per process (the
/// "process-wide singleton" the design calls for) and store it however
/// their own binary manages globals — `QueryFacade` itself stays generic
/// over `Driver` and does not impose a particular global-storage mechanism,
/// since a `static` cannot be parameterized by a caller-chosen driver type.
pub struct QueryFacade<D: Driver> {
    router: Arc<Router<D>>,
    health_monitor: Arc<HealthMonitor<D>>,
    optimizer: Arc<PoolOptimizer<D>>,
    pools: Vec<Arc<EndpointPool<D>>>,
    metrics: SharedMetrics,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    strategy_name: &'static str,
    default_region: Option<String>,
}

impl<D: Driver + 'static> QueryFacade<D> {
    /// Build every component described by `config` and wire them together,
    /// but do not spawn background tasks yet — see [`QueryFacade::start`].
    pub fn new(config: FacadeConfig, driver: Arc<D>) -> Result<Arc<Self>, RouterError> {
        let registry = Arc::new(EndpointRegistry::new(
            config.endpoints.primary_address,
            ReplicaConfig {
                addresses: config.endpoints.replica_addresses,
                regions: config.endpoints.replica_regions,
                weights: config.endpoints.replica_weights,
            },
        )?);

        let metrics: SharedMetrics = Arc::new(MetricsSink::new(config.metrics.window, config.metrics.slow_threshold));

        let primary_pool = Arc::new(EndpointPool::new(
            registry.primary().clone(),
            driver.clone(),
            config.pool.clone(),
            metrics.clone(),
        ));

        let mut replica_handles = Vec::with_capacity(registry.replicas().len());
        let mut monitored = vec![MonitoredEndpoint {
            id: registry.primary().id.clone(),
            pool: primary_pool.clone(),
            state: Arc::new(EndpointState::new(config.health.unhealthy_threshold)),
        }];
        let mut all_pools = vec![primary_pool.clone()];

        for endpoint in registry.replicas() {
            let pool = Arc::new(EndpointPool::new(
                endpoint.clone(),
                driver.clone(),
                config.pool.clone(),
                metrics.clone(),
            ));
            let state = Arc::new(EndpointState::new(config.health.unhealthy_threshold));
            monitored.push(MonitoredEndpoint {
                id: endpoint.id.clone(),
                pool: pool.clone(),
                state: state.clone(),
            });
            all_pools.push(pool.clone());
            replica_handles.push(ReplicaHandle {
                id: endpoint.id.clone(),
                pool,
                state,
            });
        }

        let strategy = build_strategy(config.load_balancer.strategy);
        let strategy_name = strategy.name();
        let default_region = config.load_balancer.user_region;

        let router = Arc::new(Router::new(
            registry,
            primary_pool,
            replica_handles,
            strategy,
            metrics.clone(),
            config.router,
        ));

        let health_monitor = Arc::new(HealthMonitor::new(monitored, config.health, metrics.clone()));
        let optimizer = Arc::new(PoolOptimizer::new(all_pools.clone(), config.optimizer, metrics.clone()));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            router,
            health_monitor,
            optimizer,
            pools: all_pools,
            metrics,
            shutdown_tx,
            closed: AtomicBool::new(false),
            strategy_name,
            default_region,
        }))
    }

    /// Spawn the health monitor, optimizer, and every pool's idle reaper.
    /// Separate from `new` so tests can exercise the facade without
    /// background tasks running.
    pub fn start(self: &Arc<Self>) {
        self.health_monitor.clone().spawn(self.shutdown_tx.subscribe());
        self.optimizer.clone().spawn(self.shutdown_tx.subscribe());
        for pool in &self.pools {
            pool.spawn_reaper();
        }
        info!("query facade started");
    }

    fn check_open(&self) -> Result<(), RouterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::PoolClosed);
        }
        Ok(())
    }

    fn effective_options(&self, mut options: QueryOptions) -> QueryOptions {
        if options.preferred_region.is_none() {
            options.preferred_region = self.default_region.clone();
        }
        options
    }

    /// Execute one statement and return its full row set.
    pub async fn exec(&self, statement: &str, params: &[Value], options: QueryOptions) -> Result<QueryOutcome, RouterError> {
        self.check_open()?;
        let options = self.effective_options(options);
        self.router.execute(statement, params, &options).await
    }

    /// Execute one statement and return a lazy, finite stream over its rows.
    /// The underlying connection is already released by the time this
    /// returns (this crate's `Driver` has no incremental-fetch primitive to
    /// stream against), so abandoning the returned stream is always safe.
    pub async fn stream(
        &self,
        statement: &str,
        params: &[Value],
        options: QueryOptions,
    ) -> Result<impl Stream<Item = Row>, RouterError> {
        let outcome = self.exec(statement, params, options).await?;
        Ok(stream::iter(outcome.rows))
    }

    /// Run `body` as a primary-side transaction, releasing the connection on
    /// every exit path (including `body` returning an error, which rolls
    /// back before release).
    pub async fn transaction<F, Fut, T>(&self, options: QueryOptions, body: F) -> Result<T, RouterError>
    where
        F: FnOnce(TransactionHandle<'_, D>) -> Fut,
        Fut: std::future::Future<Output = Result<T, RouterError>>,
    {
        self.check_open()?;
        self.router.transaction(options.deadline, body).await
    }

    /// Current per-endpoint pool stats, router performance aggregate, and
    /// the active load-balancer strategy name.
    pub async fn stats(&self) -> FacadeStats {
        let mut pool_stats_by_endpoint = HashMap::with_capacity(self.pools.len());
        for pool in &self.pools {
            let snapshot = pool.snapshot(true).await;
            pool_stats_by_endpoint.insert(snapshot.endpoint_id.clone(), snapshot);
        }
        FacadeStats {
            pool_stats_by_endpoint,
            router_stats: self.metrics.performance(),
            load_balancer_strategy: self.strategy_name,
        }
    }

    /// Stop accepting new requests, signal every background task to stop,
    /// and close every pool, draining active connections until `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        for pool in &self.pools {
            pool.close(deadline).await;
        }
        info!("query facade shut down");
    }
}

/// Classification helper re-exported for callers that want to pre-flight a
/// statement's kind without executing it (e.g. to choose `force_primary`
/// themselves).
pub fn classify_kind(statement: &str) -> QueryKind {
    crate::classifier::classify(statement).kind()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use crate::endpoint::Endpoint;
    use async_trait::async_trait;

    struct StubConn;

    struct StubDriver;

    #[async_trait]
    impl Driver for StubDriver {
        type Connection = StubConn;

        async fn connect(&self, _endpoint: &Endpoint) -> Result<Self::Connection, DriverError> {
            Ok(StubConn)
        }

        async fn ping(&self, _conn: &mut Self::Connection) -> Result<(), DriverError> {
            Ok(())
        }

        async fn execute_raw(
            &self,
            _conn: &mut Self::Connection,
            _statement: &str,
            _params: &[Value],
        ) -> Result<QueryOutcome, DriverError> {
            Ok(QueryOutcome {
                rows: vec![vec![Value::from(1)]],
                rows_affected: None,
            })
        }
    }

    fn addr(host: &str) -> ConnectAddress {
        ConnectAddress {
            host: host.into(),
            port: 5432,
            database: "app".into(),
            user: "app".into(),
            secret_ref: "vault://app".into(),
        }
    }

    fn facade() -> Arc<QueryFacade<StubDriver>> {
        let config = FacadeConfig {
            endpoints: EndpointsConfig {
                primary_address: addr("primary"),
                replica_addresses: vec![addr("r1")],
                replica_regions: vec![None],
                replica_weights: vec![1],
            },
            ..Default::default()
        };
        QueryFacade::new(config, Arc::new(StubDriver)).unwrap()
    }

    #[tokio::test]
    async fn exec_runs_a_read_against_a_replica() {
        let facade = facade();
        let outcome = facade.exec("SELECT 1", &[], QueryOptions::default()).await.unwrap();
        assert_eq!(outcome.rows.len(), 1);
    }

    #[tokio::test]
    async fn stream_yields_rows_from_exec() {
        let facade = facade();
        let stream = facade.stream("SELECT 1", &[], QueryOptions::default()).await.unwrap();
        let rows: Vec<_> = futures::StreamExt::collect(stream).await;
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_subsequent_calls() {
        let facade = facade();
        facade.shutdown(Duration::from_secs(1)).await;
        let result = facade.exec("SELECT 1", &[], QueryOptions::default()).await;
        assert!(matches!(result, Err(RouterError::PoolClosed)));
    }

    #[tokio::test]
    async fn stats_reports_every_endpoint() {
        let facade = facade();
        facade.exec("SELECT 1", &[], QueryOptions::default()).await.unwrap();
        let stats = facade.stats().await;
        assert_eq!(stats.pool_stats_by_endpoint.len(), 2);
    }

    #[tokio::test]
    async fn transaction_runs_and_commits() {
        let facade = facade();
        let result = facade
            .transaction(QueryOptions::default(), |mut tx| async move {
                tx.exec("INSERT INTO users(name) VALUES ($1)", &[]).await
            })
            .await;
        assert!(result.is_ok());
    }
}
