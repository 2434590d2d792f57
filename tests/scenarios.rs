//! End-to-end scenarios A-G from the router's decision/failover contract,
//! exercised against the public `Router` surface with an in-memory driver.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use dbrouter::{
    ConnectAddress, Consistency, Driver, DriverError, Endpoint, EndpointPool, EndpointRegistry,
    EndpointState, MetricsSink, PoolConfig, QueryOptions, QueryOutcome, ReplicaConfig,
    ReplicaHandle, Router, RouterConfig, RouterError, SharedMetrics, Target,
};
use dbrouter::strategies::RoundRobinStrategy;

struct ScriptedDriver {
    fail_next_transient: AtomicBool,
    fail_next_permanent: AtomicBool,
    calls: AtomicU32,
}

impl ScriptedDriver {
    fn new() -> Self {
        Self {
            fail_next_transient: AtomicBool::new(false),
            fail_next_permanent: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    type Connection = ();

    async fn connect(&self, _endpoint: &Endpoint) -> Result<Self::Connection, DriverError> {
        Ok(())
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
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_next_permanent.swap(false, Ordering::Relaxed) {
            return Err(DriverError::permanent("syntax error"));
        }
        if self.fail_next_transient.swap(false, Ordering::Relaxed) {
            return Err(DriverError::transient("connection reset"));
        }
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
        secret_ref: "vault://app/db".into(),
    }
}

fn metrics() -> SharedMetrics {
    Arc::new(MetricsSink::new(Duration::from_secs(300), Duration::from_millis(100)))
}

struct Topology {
    router: Router<ScriptedDriver>,
    replica_drivers: Vec<Arc<ScriptedDriver>>,
    replica_ids: Vec<String>,
}

fn build_topology(replica_regions: &[Option<&str>], router_config: RouterConfig) -> Topology {
    let registry = Arc::new(
        EndpointRegistry::new(
            addr("primary"),
            ReplicaConfig {
                addresses: replica_regions.iter().map(|_| addr("replica")).collect(),
                regions: replica_regions.iter().map(|r| r.map(String::from)).collect(),
                weights: vec![1; replica_regions.len()],
            },
        )
        .unwrap(),
    );

    let primary_pool = Arc::new(EndpointPool::new(
        registry.primary().clone(),
        Arc::new(ScriptedDriver::new()),
        PoolConfig::default(),
        metrics(),
    ));

    let mut replica_drivers = Vec::with_capacity(registry.replicas().len());
    let mut replica_ids = Vec::with_capacity(registry.replicas().len());
    let mut replicas = Vec::with_capacity(registry.replicas().len());
    for endpoint in registry.replicas() {
        let driver = Arc::new(ScriptedDriver::new());
        replica_ids.push(endpoint.id.clone());
        replicas.push(ReplicaHandle {
            id: endpoint.id.clone(),
            pool: Arc::new(EndpointPool::new(endpoint.clone(), driver.clone(), PoolConfig::default(), metrics())),
            state: Arc::new(EndpointState::new(3)),
        });
        replica_drivers.push(driver);
    }

    let router = Router::new(
        registry,
        primary_pool,
        replicas,
        Box::new(RoundRobinStrategy::new()),
        metrics(),
        router_config,
    );

    Topology {
        router,
        replica_drivers,
        replica_ids,
    }
}

/// Scenario A — simple read with replicas healthy cycles round-robin
/// across R1 and R2, with no write recorded.
#[tokio::test]
async fn scenario_a_simple_read_with_replicas_healthy() {
    let topo = build_topology(&[Some("us"), Some("eu")], RouterConfig::default());
    let opts = QueryOptions::default();

    let (first, _, _) = topo.router.plan("SELECT 1", &opts).await;
    let (second, _, _) = topo.router.plan("SELECT 1", &opts).await;
    let (third, _, _) = topo.router.plan("SELECT 1", &opts).await;

    assert_eq!(first.target, Target::Replica);
    assert_eq!(first.endpoint_id.as_deref(), Some(topo.replica_ids[0].as_str()));
    assert_eq!(second.endpoint_id.as_deref(), Some(topo.replica_ids[1].as_str()));
    assert_eq!(third.endpoint_id.as_deref(), Some(topo.replica_ids[0].as_str()));

    topo.router.execute("SELECT 1", &[], &opts).await.unwrap();
    assert_eq!(topo.replica_drivers[0].calls.load(Ordering::Relaxed), 1);
}

/// Scenario B — read-your-writes: a write routes to primary, a read
/// within the staleness window also routes to primary, and a read after
/// staleness expires routes to a replica.
#[tokio::test]
async fn scenario_b_read_your_writes() {
    let topo = build_topology(&[Some("us"), Some("eu")], RouterConfig::default());
    let opts = QueryOptions {
        max_staleness: Duration::from_millis(30),
        ..Default::default()
    };

    let (write_decision, _, _) = topo.router.plan("INSERT INTO users(name) VALUES($1)", &opts).await;
    assert_eq!(write_decision.target, Target::Primary);
    assert_eq!(write_decision.reason, "non-read statement");
    topo.router
        .execute("INSERT INTO users(name) VALUES($1)", &[Value::from("x")], &opts)
        .await
        .unwrap();

    let (soon, _, _) = topo.router.plan("SELECT * FROM users WHERE name='x'", &opts).await;
    assert_eq!(soon.target, Target::Primary);
    assert_eq!(soon.reason, "recent write");

    tokio::time::sleep(Duration::from_millis(60)).await;

    let (later, _, _) = topo.router.plan("SELECT * FROM users WHERE name='x'", &opts).await;
    assert_eq!(later.target, Target::Replica);
    assert_eq!(later.reason, "eventual-consistency read");
}

/// Scenario C — strong consistency always routes to primary regardless
/// of replica health.
#[tokio::test]
async fn scenario_c_strong_consistency_override() {
    let topo = build_topology(&[Some("us"), Some("eu")], RouterConfig::default());
    let opts = QueryOptions {
        consistency: Consistency::Strong,
        ..Default::default()
    };

    let (decision, _, _) = topo
        .router
        .plan("SELECT balance FROM accounts WHERE id=$1", &opts)
        .await;
    assert_eq!(decision.target, Target::Primary);
    assert_eq!(decision.reason, "strong consistency");
}

/// Scenario D — a transient error on the first-chosen replica fails over
/// to the other replica within the same call, and increments the failed
/// replica's consecutive-failure counter.
#[tokio::test]
async fn scenario_d_replica_failover() {
    let topo = build_topology(&[Some("us"), Some("eu")], RouterConfig::default());
    topo.replica_drivers[0].fail_next_transient.store(true, Ordering::Relaxed);
    let opts = QueryOptions::default();

    let outcome = topo.router.execute("SELECT 1", &[], &opts).await;
    assert!(outcome.is_ok());
    assert_eq!(topo.replica_drivers[0].calls.load(Ordering::Relaxed), 1);
    assert_eq!(topo.replica_drivers[1].calls.load(Ordering::Relaxed), 1);
    assert_eq!(topo.router.registry().replicas().len(), 2);
}

/// Scenario E — every replica fails transiently; the router tries each
/// once and then falls back to primary, and the query still succeeds.
#[tokio::test]
async fn scenario_e_full_replica_outage_falls_back_to_primary() {
    let topo = build_topology(&[Some("us"), Some("eu")], RouterConfig::default());
    for driver in &topo.replica_drivers {
        driver.fail_next_transient.store(true, Ordering::Relaxed);
    }
    let opts = QueryOptions::default();

    let outcome = topo.router.execute("SELECT 1", &[], &opts).await;
    assert!(outcome.is_ok());
    for driver in &topo.replica_drivers {
        assert_eq!(driver.calls.load(Ordering::Relaxed), 1);
    }
}

/// Scenario E(b) — the same outage with fallback disabled surfaces
/// `AllReplicasFailed` instead of silently using primary.
#[tokio::test]
async fn scenario_e_outage_without_fallback_fails() {
    let topo = build_topology(
        &[Some("us"), Some("eu")],
        RouterConfig {
            fallback_to_primary: false,
            ..Default::default()
        },
    );
    for driver in &topo.replica_drivers {
        driver.fail_next_transient.store(true, Ordering::Relaxed);
    }
    let opts = QueryOptions::default();

    let result = topo.router.execute("SELECT 1", &[], &opts).await;
    assert!(matches!(result, Err(RouterError::AllReplicasFailed(_))));
}

/// Scenario F — `force_replica` with a zero-replica topology fails
/// immediately with `NoReplicaAvailable`.
#[tokio::test]
async fn scenario_f_force_replica_with_no_replicas() {
    let topo = build_topology(&[], RouterConfig::default());
    let opts = QueryOptions {
        force_replica: true,
        ..Default::default()
    };

    let result = topo.router.execute("SELECT 1", &[], &opts).await;
    assert!(matches!(result, Err(RouterError::NoReplicaAvailable)));
}

/// Scenario G — a transaction runs two inserts on the same primary
/// connection; both relations are recorded as recent writes on commit,
/// and a subsequent read within the staleness window still routes to
/// primary.
#[tokio::test]
async fn scenario_g_transactional_write() {
    let topo = build_topology(&[Some("us"), Some("eu")], RouterConfig::default());
    let opts = QueryOptions::default();

    topo.router
        .transaction(Duration::from_secs(5), |mut tx| async move {
            tx.exec("INSERT INTO orders(id) VALUES (1)", &[]).await?;
            tx.exec("INSERT INTO order_items(order_id) VALUES (1)", &[]).await?;
            Ok(())
        })
        .await
        .unwrap();

    let (decision, _, _) = topo.router.plan("SELECT * FROM orders WHERE id=1", &opts).await;
    assert_eq!(decision.target, Target::Primary);
    assert_eq!(decision.reason, "recent write");
}
