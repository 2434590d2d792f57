//! # dbrouter
//!
//! Pooled, observable, read-write-splitting query router for a primary
//! database and its read replicas.
//!
//! ## Features
//!
//! - **Connection pooling per endpoint**: bounded pools with FIFO waiter
//!   queues, idle reaping, and adaptive resizing.
//! - **Health monitoring**: periodic probes with hysteresis-based
//!   healthy/unhealthy transitions.
//! - **Load balancing**: seven selectable strategies plus an adaptive mode
//!   that switches between them based on observed latency variance.
//! - **Read/write splitting**: statement classification routes writes to
//!   the primary and reads to replicas, honoring consistency requirements
//!   and recent-write staleness.
//! - **Pool optimization**: background worker that grows and shrinks each
//!   pool's bounds based on utilization.
//! - **Metrics**: rolling query performance, slow-query log, and
//!   per-endpoint counters.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbrouter::{QueryFacade, FacadeConfig, EndpointsConfig, ConnectAddress, QueryOptions};
//! use std::sync::Arc;
//!
//! # async fn run<D: dbrouter::Driver + 'static>(driver: Arc<D>) -> Result<(), dbrouter::RouterError> {
//! let config = FacadeConfig {
//!     endpoints: EndpointsConfig {
//!         primary_address: ConnectAddress {
//!             host: "primary.db.internal".into(),
//!             port: 5432,
//!             database: "app".into(),
//!             user: "app".into(),
//!             secret_ref: "vault://app/db".into(),
//!         },
//!         replica_addresses: vec![],
//!         replica_regions: vec![],
//!         replica_weights: vec![],
//!     },
//!     ..Default::default()
//! };
//!
//! let facade = QueryFacade::new(config, driver)?;
//! facade.start();
//!
//! let outcome = facade.exec("SELECT 1", &[], QueryOptions::default()).await?;
//! println!("rows: {}", outcome.rows.len());
//!
//! facade.shutdown(std::time::Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod facade;
pub mod health;
pub mod metrics;
pub mod optimizer;
pub mod pool;
pub mod registry;
pub mod router;
pub mod strategies;

pub use classifier::{classify, QueryClass, QueryKind};
pub use driver::{Driver, DriverError, QueryOutcome, Row};
pub use endpoint::{
    ConnectAddress, Endpoint, EndpointRole, EndpointSnapshot, EndpointState, RollingCounters,
};
pub use error::RouterError;
pub use facade::{
    classify_kind, EndpointsConfig, FacadeConfig, FacadeStats, LoadBalancerConfig, MetricsConfig,
    QueryFacade,
};
pub use health::{HealthConfig, HealthMonitor, MonitoredEndpoint};
pub use metrics::{MetricsSink, PerformanceSummary, SharedMetrics};
pub use optimizer::{OptimizerConfig, PoolOptimizer};
pub use pool::{Connection, EndpointPool, PoolConfig};
pub use registry::{EndpointRegistry, ReplicaConfig};
pub use router::{
    Consistency, QueryOptions, ReplicaHandle, Router, RouterConfig, RoutingDecision, Target,
    TransactionHandle,
};
pub use strategies::{build_strategy, ReplicaStrategy, SelectionContext, StrategyKind};
