//! The Router: chooses primary or a replica per request, tracks recent
//! writes for read-your-writes, and handles replica-to-replica and
//! replica-to-primary fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::classifier::{self, QueryKind};
use crate::driver::{Driver, QueryOutcome};
use crate::endpoint::EndpointState;
use crate::error::RouterError;
use crate::metrics::SharedMetrics;
use crate::pool::EndpointPool;
use crate::registry::EndpointRegistry;
use crate::strategies::{ReplicaStrategy, SelectionContext};

/// Per-request options governing routing, consistency, and deadlines.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Always target primary.
    pub force_primary: bool,
    /// Always target a replica; fail with `no_replica_available` if none
    /// is healthy.
    pub force_replica: bool,
    /// Consistency requirement for reads.
    pub consistency: Consistency,
    /// Maximum staleness a replica read may tolerate relative to the most
    /// recent observed write on any relation it touches.
    pub max_staleness: Duration,
    /// Caller-preferred region, consumed by the `geographic` strategy.
    pub preferred_region: Option<String>,
    /// Caller-supplied key, consumed only by the `hash` strategy.
    pub routing_key: Option<String>,
    /// Absolute deadline for this request's acquire + execute.
    pub deadline: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            force_primary: false,
            force_replica: false,
            consistency: Consistency::Eventual,
            max_staleness: Duration::from_secs(1),
            preferred_region: None,
            routing_key: None,
            deadline: Duration::from_secs(10),
        }
    }
}

/// Read consistency requested for a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Route through `RecentWriteMap`/replica health as usual.
    #[default]
    Eventual,
    /// Always route to primary.
    Strong,
}

/// Which endpoint a `RoutingDecision` targeted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// The primary endpoint.
    Primary,
    /// A replica endpoint.
    Replica,
}

/// Diagnostic record of how one request was routed, returned to the
/// caller and published to the Metrics Sink (sampled).
#[derive(Clone, Debug)]
pub struct RoutingDecision {
    /// Whether this request went to primary or a replica.
    pub target: Target,
    /// Endpoint id actually used. `None` only if the request failed before
    /// any endpoint was selected.
    pub endpoint_id: Option<String>,
    /// Human-readable reason the decision algorithm fired on.
    pub reason: &'static str,
    /// Name of the load-balancing strategy consulted, if any (replica
    /// decisions only).
    pub matched_strategy: Option<&'static str>,
}

/// Mapping from relation name to the timestamp of the most recent write
/// this router has observed against it.
#[derive(Default)]
pub struct RecentWriteMap {
    inner: Mutex<HashMap<String, Instant>>,
}

impl RecentWriteMap {
    /// Record a write against every relation in `relations`, all at `now`.
    pub fn record_write(&self, relations: impl IntoIterator<Item = String>, now: Instant) {
        let mut inner = self.inner.lock();
        for relation in relations {
            inner.insert(relation, now);
        }
    }

    /// Whether any of `relations` was written within `max_staleness` of
    /// `now`. A relation this router has never observed a write for is
    /// *not* protected — see the spec's documented read-your-writes
    /// limitation: a caller whose relation is written by another process
    /// is outside what `RecentWriteMap` can see.
    pub fn has_recent_write(&self, relations: &std::collections::BTreeSet<String>, max_staleness: Duration, now: Instant) -> bool {
        let inner = self.inner.lock();
        relations.iter().any(|relation| {
            inner
                .get(relation)
                .is_some_and(|&written_at| now.saturating_duration_since(written_at) < max_staleness)
        })
    }

    /// Drop entries older than `prune_older_than`, called opportunistically
    /// by callers that hold a write lock already (e.g. after recording a
    /// batch of writes). Not required for correctness, only memory.
    pub fn prune(&self, prune_older_than: Duration, now: Instant) {
        let mut inner = self.inner.lock();
        inner.retain(|_, &mut written_at| now.saturating_duration_since(written_at) <= prune_older_than);
    }
}

/// Router-level defaults, distinct from per-request `QueryOptions`
/// overrides.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Default consistency when a caller doesn't specify one.
    pub consistency: Consistency,
    /// Default staleness bound.
    pub max_staleness: Duration,
    /// Whether a fully-failed replica set may fall back to primary.
    pub fallback_to_primary: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            consistency: Consistency::Eventual,
            max_staleness: Duration::from_secs(1),
            fallback_to_primary: true,
        }
    }
}

/// One replica's pool plus its health state, as the Router sees it.
pub struct ReplicaHandle<D: Driver> {
    /// Replica endpoint id.
    pub id: String,
    /// The replica's pool.
    pub pool: Arc<EndpointPool<D>>,
    /// Hysteresis state, shared with the `HealthMonitor`.
    pub state: Arc<EndpointState>,
}

/// The brain: chooses primary or a replica per request and executes the
/// statement, handling replica failover and read-your-writes tracking.
///
/// Holds non-owning references to the registry, strategy, and metrics
/// sink; none of those hold a back-reference to the router (see the
/// spec's note against cyclic references between router and replica
/// manager).
pub struct Router<D: Driver> {
    registry: Arc<EndpointRegistry>,
    primary_pool: Arc<EndpointPool<D>>,
    replicas: Vec<ReplicaHandle<D>>,
    strategy: Box<dyn ReplicaStrategy>,
    recent_writes: RecentWriteMap,
    metrics: SharedMetrics,
    config: RouterConfig,
    request_seq: AtomicU64,
}

impl<D: Driver> Router<D> {
    /// Construct a router over one primary pool and any number of replica
    /// handles, using `strategy` for replica selection.
    pub fn new(
        registry: Arc<EndpointRegistry>,
        primary_pool: Arc<EndpointPool<D>>,
        replicas: Vec<ReplicaHandle<D>>,
        strategy: Box<dyn ReplicaStrategy>,
        metrics: SharedMetrics,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            primary_pool,
            replicas,
            strategy,
            recent_writes: RecentWriteMap::default(),
            metrics,
            config,
            request_seq: AtomicU64::new(0),
        }
    }

    /// The registry this router was built over (read-only access, e.g. for
    /// `stats()`).
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    async fn healthy_replica_snapshots(&self, excluded: &[String]) -> Vec<crate::endpoint::EndpointSnapshot> {
        let mut snapshots = Vec::new();
        for r in &self.replicas {
            if r.state.is_healthy() && !excluded.contains(&r.id) {
                snapshots.push(r.pool.snapshot(true).await);
            }
        }
        snapshots
    }

    fn replica_by_id(&self, id: &str) -> Option<&ReplicaHandle<D>> {
        self.replicas.iter().find(|r| r.id == id)
    }

    /// Decide where a statement should be routed, without executing it.
    /// This is the decision algorithm from the spec, steps 1-7 in priority
    /// order; the first rule that fires wins.
    pub async fn plan(&self, statement: &str, options: &QueryOptions) -> (RoutingDecision, QueryKind, std::collections::BTreeSet<String>) {
        let class = classifier::classify(statement);
        let kind = class.kind();

        if options.force_primary {
            return (
                RoutingDecision {
                    target: Target::Primary,
                    endpoint_id: None,
                    reason: "forced primary",
                    matched_strategy: None,
                },
                kind,
                class.relations,
            );
        }

        if kind.requires_primary() {
            return (
                RoutingDecision {
                    target: Target::Primary,
                    endpoint_id: None,
                    reason: "non-read statement",
                    matched_strategy: None,
                },
                kind,
                class.relations,
            );
        }

        if options.force_replica {
            let healthy = self.healthy_replica_snapshots(&[]).await;
            let ctx = SelectionContext {
                routing_key: options.routing_key.as_deref(),
                preferred_region: options.preferred_region.as_deref(),
            };
            return match self.strategy.select(&healthy, ctx) {
                Some(id) => (
                    RoutingDecision {
                        target: Target::Replica,
                        endpoint_id: Some(id),
                        reason: "forced replica",
                        matched_strategy: Some(self.strategy.name()),
                    },
                    kind,
                    class.relations,
                ),
                None => (
                    RoutingDecision {
                        target: Target::Primary,
                        endpoint_id: None,
                        reason: "forced replica but none healthy",
                        matched_strategy: None,
                    },
                    kind,
                    class.relations,
                ),
            };
        }

        let healthy = self.healthy_replica_snapshots(&[]).await;
        if healthy.is_empty() {
            return (
                RoutingDecision {
                    target: Target::Primary,
                    endpoint_id: None,
                    reason: "no healthy replica",
                    matched_strategy: None,
                },
                kind,
                class.relations,
            );
        }

        if options.consistency == Consistency::Strong {
            return (
                RoutingDecision {
                    target: Target::Primary,
                    endpoint_id: None,
                    reason: "strong consistency",
                    matched_strategy: None,
                },
                kind,
                class.relations,
            );
        }

        let now = Instant::now();
        if self
            .recent_writes
            .has_recent_write(&class.relations, options.max_staleness, now)
        {
            return (
                RoutingDecision {
                    target: Target::Primary,
                    endpoint_id: None,
                    reason: "recent write",
                    matched_strategy: None,
                },
                kind,
                class.relations,
            );
        }

        let ctx = SelectionContext {
            routing_key: options.routing_key.as_deref(),
            preferred_region: options.preferred_region.as_deref(),
        };
        let decision = match self.strategy.select(&healthy, ctx) {
            Some(id) => RoutingDecision {
                target: Target::Replica,
                endpoint_id: Some(id),
                reason: "eventual-consistency read",
                matched_strategy: Some(self.strategy.name()),
            },
            None => RoutingDecision {
                target: Target::Primary,
                endpoint_id: None,
                reason: "no healthy replica",
                matched_strategy: None,
            },
        };
        (decision, kind, class.relations)
    }

    /// Plan and execute one statement, handling replica failover and
    /// read-your-writes bookkeeping.
    pub async fn execute(
        &self,
        statement: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryOutcome, RouterError> {
        let request_id = self.request_seq.fetch_add(1, Ordering::Relaxed);
        let (decision, kind, relations) = self.plan(statement, options).await;
        self.metrics.record_routing_decision(request_id, format!("{:?}:{}", decision.target, decision.reason));

        if decision.reason == "forced replica but none healthy" {
            return Err(RouterError::NoReplicaAvailable);
        }

        match decision.target {
            Target::Primary => self.execute_on_primary(statement, params, options, kind, &relations).await,
            Target::Replica => {
                self.execute_on_replica(statement, params, options, decision.endpoint_id, &[])
                    .await
            }
        }
    }

    async fn execute_on_primary(
        &self,
        statement: &str,
        params: &[Value],
        options: &QueryOptions,
        kind: QueryKind,
        relations: &std::collections::BTreeSet<String>,
    ) -> Result<QueryOutcome, RouterError> {
        let mut conn = self.primary_pool.acquire(options.deadline).await?;
        let result = self
            .primary_pool
            .run_on(&mut conn, statement, params, options.deadline)
            .await;
        self.primary_pool.release(conn).await;

        if result.is_ok() && matches!(kind, QueryKind::Write | QueryKind::Ddl | QueryKind::TxControl | QueryKind::Unknown) {
            self.recent_writes.record_write(relations.iter().cloned(), Instant::now());
        }
        result
    }

    async fn execute_on_replica(
        &self,
        statement: &str,
        params: &[Value],
        options: &QueryOptions,
        first_choice: Option<String>,
        already_excluded: &[String],
    ) -> Result<QueryOutcome, RouterError> {
        let mut excluded: Vec<String> = already_excluded.to_vec();
        let mut target_id = first_choice;

        loop {
            let Some(id) = target_id.clone() else {
                return self.fall_back_to_primary(statement, params, options).await;
            };

            let Some(handle) = self.replica_by_id(&id) else {
                excluded.push(id);
                target_id = self.reselect_replica(options, &excluded).await;
                continue;
            };

            let acquired = handle.pool.acquire(options.deadline).await;
            let mut conn = match acquired {
                Ok(conn) => conn,
                Err(e) => {
                    if e.is_transient() && !options.force_replica {
                        handle.state.record_failure();
                        excluded.push(id);
                        target_id = self.reselect_replica(options, &excluded).await;
                        continue;
                    }
                    return Err(e);
                }
            };

            let result = handle.pool.run_on(&mut conn, statement, params, options.deadline).await;
            handle.pool.release(conn).await;

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => {
                    handle.state.record_failure();
                    if options.force_replica {
                        return Err(e);
                    }
                    excluded.push(id);
                    target_id = self.reselect_replica(options, &excluded).await;
                    debug!(excluded = ?excluded, "replica transient failure, retrying another replica");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reselect_replica(&self, options: &QueryOptions, excluded: &[String]) -> Option<String> {
        let healthy = self.healthy_replica_snapshots(excluded).await;
        let ctx = SelectionContext {
            routing_key: options.routing_key.as_deref(),
            preferred_region: options.preferred_region.as_deref(),
        };
        self.strategy.select(&healthy, ctx)
    }

    async fn fall_back_to_primary(
        &self,
        statement: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryOutcome, RouterError> {
        if !self.config.fallback_to_primary || options.force_replica {
            return Err(RouterError::AllReplicasFailed(
                "every healthy replica returned a transient error".into(),
            ));
        }
        warn!("all replicas exhausted, falling back to primary");
        let mut conn = self.primary_pool.acquire(options.deadline).await?;
        let result = self.primary_pool.run_on(&mut conn, statement, params, options.deadline).await;
        self.primary_pool.release(conn).await;
        result
    }

    /// Run a closure against a single acquired primary connection as a
    /// transaction: `BEGIN`, the closure, `COMMIT` on success or
    /// `ROLLBACK` on error, with the connection released on every exit
    /// path — including an early `?` (e.g. `BEGIN` itself failing) and a
    /// panic unwinding through `body`, both guaranteed by `ConnGuard`.
    /// Relations written inside a successful transaction are recorded in
    /// `RecentWriteMap` atomically at commit time.
    pub async fn transaction<F, Fut, T>(&self, deadline: Duration, body: F) -> Result<T, RouterError>
    where
        F: FnOnce(TransactionHandle<'_, D>) -> Fut,
        Fut: std::future::Future<Output = Result<T, RouterError>>,
    {
        let conn = self.primary_pool.acquire(deadline).await?;
        let mut guard = ConnGuard::new(Arc::clone(&self.primary_pool), conn);

        self.primary_pool.run_on(guard.as_mut(), "BEGIN", &[], deadline).await?;

        let written_relations = Mutex::new(std::collections::BTreeSet::new());
        let handle = TransactionHandle {
            pool: &self.primary_pool,
            conn: guard.as_mut(),
            deadline,
            written_relations: &written_relations,
        };

        let result = body(handle).await;

        let outcome = match &result {
            Ok(_) => self.primary_pool.run_on(guard.as_mut(), "COMMIT", &[], deadline).await,
            Err(_) => {
                let _ = self.primary_pool.run_on(guard.as_mut(), "ROLLBACK", &[], deadline).await;
                Ok(QueryOutcome::default())
            }
        };

        self.primary_pool.release(guard.take()).await;

        if result.is_ok() && outcome.is_ok() {
            let relations = written_relations.into_inner();
            self.recent_writes.record_write(relations, Instant::now());
        }

        result
    }
}

/// Scoped acquisition around a single primary connection: guarantees the
/// connection is handed back to the pool no matter how the scope is exited.
/// On the normal path the caller disarms it with `take` and releases
/// synchronously; on an early `?` or a panic unwinding through `body`,
/// `Drop` spawns the release so the pool slot is never leaked (spec's "one
/// primitive that guarantees release on every exit path", applied to
/// transactions the same way `acquire`/`release` already is to single
/// statements).
struct ConnGuard<D: Driver> {
    pool: Arc<EndpointPool<D>>,
    conn: Option<crate::pool::Connection<D::Connection>>,
}

impl<D: Driver> ConnGuard<D> {
    fn new(pool: Arc<EndpointPool<D>>, conn: crate::pool::Connection<D::Connection>) -> Self {
        Self { pool, conn: Some(conn) }
    }

    fn as_mut(&mut self) -> &mut crate::pool::Connection<D::Connection> {
        self.conn.as_mut().expect("connection already released")
    }

    /// Disarm the guard and hand the connection back to the caller for an
    /// explicit, synchronous release.
    fn take(mut self) -> crate::pool::Connection<D::Connection> {
        self.conn.take().expect("connection already released")
    }
}

impl<D: Driver> Drop for ConnGuard<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                pool.release(conn).await;
            });
        }
    }
}

/// Handle threaded into a `transaction` closure; every statement issued
/// through it runs on the same acquired primary connection.
pub struct TransactionHandle<'a, D: Driver> {
    pool: &'a EndpointPool<D>,
    conn: &'a mut crate::pool::Connection<D::Connection>,
    deadline: Duration,
    written_relations: &'a Mutex<std::collections::BTreeSet<String>>,
}

impl<'a, D: Driver> TransactionHandle<'a, D> {
    /// Execute one statement on the transaction's connection, recording
    /// any relations it writes for commit-time `RecentWriteMap` updates.
    pub async fn exec(&mut self, statement: &str, params: &[Value]) -> Result<QueryOutcome, RouterError> {
        let class = classifier::classify(statement);
        let outcome = self.pool.run_on(self.conn, statement, params, self.deadline).await?;
        if matches!(
            class.kind(),
            QueryKind::Write | QueryKind::Ddl | QueryKind::TxControl | QueryKind::Unknown
        ) {
            self.written_relations.lock().extend(class.relations);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverError, Row};
    use crate::endpoint::{ConnectAddress, Endpoint};
    use crate::metrics::MetricsSink;
    use crate::pool::PoolConfig;
    use crate::strategies::RoundRobinStrategy;
    use async_trait::async_trait;

    struct StubConn;

    struct ScriptedDriver {
        fail_next: AtomicBool,
        permanent_error: AtomicBool,
    }
    use std::sync::atomic::AtomicBool;

    impl ScriptedDriver {
        fn new() -> Self {
            Self {
                fail_next: AtomicBool::new(false),
                permanent_error: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
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
            if self.fail_next.swap(false, Ordering::Relaxed) {
                if self.permanent_error.load(Ordering::Relaxed) {
                    return Err(DriverError::permanent("syntax error"));
                }
                return Err(DriverError::transient("connection reset"));
            }
            Ok(QueryOutcome {
                rows: vec![Row::new()],
                rows_affected: None,
            })
        }
    }

    fn addr() -> ConnectAddress {
        ConnectAddress {
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            user: "app".into(),
            secret_ref: "vault://app".into(),
        }
    }

    fn metrics() -> SharedMetrics {
        Arc::new(MetricsSink::new(Duration::from_secs(300), Duration::from_millis(100)))
    }

    fn build_router_with_drivers(n_replicas: usize) -> (Router<ScriptedDriver>, Vec<Arc<ScriptedDriver>>) {
        let primary_driver = Arc::new(ScriptedDriver::new());
        let replica_drivers: Vec<Arc<ScriptedDriver>> = (0..n_replicas).map(|_| Arc::new(ScriptedDriver::new())).collect();

        let registry = Arc::new(
            EndpointRegistry::new(
                addr(),
                crate::registry::ReplicaConfig {
                    addresses: (0..n_replicas).map(|_| addr()).collect(),
                    regions: vec![None; n_replicas],
                    weights: vec![1; n_replicas],
                },
            )
            .unwrap(),
        );

        let primary_pool = Arc::new(EndpointPool::new(
            registry.primary().clone(),
            primary_driver.clone(),
            PoolConfig::default(),
            metrics(),
        ));

        let replicas: Vec<ReplicaHandle<ScriptedDriver>> = registry
            .replicas()
            .iter()
            .zip(replica_drivers.iter())
            .map(|(e, d)| ReplicaHandle {
                id: e.id.clone(),
                pool: Arc::new(EndpointPool::new(e.clone(), d.clone(), PoolConfig::default(), metrics())),
                state: Arc::new(EndpointState::new(3)),
            })
            .collect();

        let router = Router::new(
            registry,
            primary_pool,
            replicas,
            Box::new(RoundRobinStrategy::new()),
            metrics(),
            RouterConfig::default(),
        );
        (router, replica_drivers)
    }

    fn build_router(n_replicas: usize) -> Router<ScriptedDriver> {
        build_router_with_drivers(n_replicas).0
    }

    #[tokio::test]
    async fn write_statement_routes_to_primary() {
        let router = build_router(2);
        let opts = QueryOptions::default();
        let (decision, kind, _) = router.plan("INSERT INTO users(name) VALUES ($1)", &opts).await;
        assert_eq!(decision.target, Target::Primary);
        assert_eq!(decision.reason, "non-read statement");
        assert_eq!(kind, QueryKind::Write);
    }

    #[tokio::test]
    async fn read_with_healthy_replicas_routes_to_replica() {
        let router = build_router(2);
        let opts = QueryOptions::default();
        let (decision, _, _) = router.plan("SELECT 1", &opts).await;
        assert_eq!(decision.target, Target::Replica);
        assert_eq!(decision.reason, "eventual-consistency read");
    }

    #[tokio::test]
    async fn strong_consistency_forces_primary() {
        let router = build_router(2);
        let opts = QueryOptions {
            consistency: Consistency::Strong,
            ..Default::default()
        };
        let (decision, _, _) = router.plan("SELECT balance FROM accounts WHERE id=$1", &opts).await;
        assert_eq!(decision.target, Target::Primary);
        assert_eq!(decision.reason, "strong consistency");
    }

    #[tokio::test]
    async fn force_replica_with_no_replicas_fails() {
        let router = build_router(0);
        let opts = QueryOptions {
            force_replica: true,
            ..Default::default()
        };
        let result = router.execute("SELECT 1", &[], &opts).await;
        assert!(matches!(result, Err(RouterError::NoReplicaAvailable)));
    }

    #[tokio::test]
    async fn recent_write_routes_subsequent_read_to_primary() {
        let router = build_router(2);
        let opts = QueryOptions::default();

        router
            .execute("INSERT INTO users(name) VALUES ($1)", &[], &opts)
            .await
            .unwrap();

        let (decision, _, _) = router.plan("SELECT * FROM users WHERE name='x'", &opts).await;
        assert_eq!(decision.target, Target::Primary);
        assert_eq!(decision.reason, "recent write");
    }

    #[tokio::test]
    async fn stale_enough_read_routes_to_replica_after_write() {
        let router = build_router(2);
        let opts = QueryOptions {
            max_staleness: Duration::from_millis(1),
            ..Default::default()
        };

        router
            .execute("INSERT INTO users(name) VALUES ($1)", &[], &opts)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (decision, _, _) = router.plan("SELECT * FROM users WHERE name='x'", &opts).await;
        assert_eq!(decision.target, Target::Replica);
    }

    #[tokio::test]
    async fn transient_replica_failure_fails_over_to_another_replica() {
        let (router, drivers) = build_router_with_drivers(2);
        drivers[0].fail_next.store(true, Ordering::Relaxed);
        let opts = QueryOptions::default();

        let result = router.execute("SELECT 1", &[], &opts).await;
        assert!(result.is_ok());
        let r0 = &router.replicas[0];
        assert_eq!(r0.state.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn transactional_write_updates_recent_write_map_on_commit() {
        let router = build_router(2);
        let opts = QueryOptions::default();

        router
            .transaction(Duration::from_secs(5), |mut tx| async move {
                tx.exec("INSERT INTO orders(id) VALUES (1)", &[]).await?;
                tx.exec("INSERT INTO order_items(order_id) VALUES (1)", &[]).await?;
                Ok(())
            })
            .await
            .unwrap();

        let (decision, _, _) = router.plan("SELECT * FROM orders", &opts).await;
        assert_eq!(decision.target, Target::Primary);
        assert_eq!(decision.reason, "recent write");
    }

    #[tokio::test]
    async fn begin_failure_releases_connection_instead_of_leaking() {
        let primary_driver = Arc::new(ScriptedDriver::new());
        let registry = Arc::new(EndpointRegistry::new(addr(), crate::registry::ReplicaConfig::default()).unwrap());
        let primary_pool = Arc::new(EndpointPool::new(
            registry.primary().clone(),
            primary_driver.clone(),
            PoolConfig {
                min_size: 0,
                max_size: 1,
                acquire_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            metrics(),
        ));
        let router = Router::new(
            registry,
            primary_pool.clone(),
            vec![],
            Box::new(RoundRobinStrategy::new()),
            metrics(),
            RouterConfig::default(),
        );

        primary_driver.fail_next.store(true, Ordering::Relaxed);

        let result = router
            .transaction(Duration::from_millis(200), |mut tx| async move {
                tx.exec("INSERT INTO users(name) VALUES ($1)", &[]).await
            })
            .await;
        assert!(result.is_err());

        // Let the guard's spawned release task run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // With max_size = 1, a leaked connection would make this time out.
        let reacquired = primary_pool.acquire(Duration::from_millis(200)).await;
        assert!(reacquired.is_ok());
    }
}
