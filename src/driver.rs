//! Pluggable driver abstraction.
//!
//! On-wire protocol parsing is explicitly out of scope for this crate (see
//! the purpose & scope notes), so the pool and router never speak to a
//! database directly. Instead they hold a `Arc<dyn Driver>` and call through
//! it, the same way a generic connection pool holds a `ManageConnection`
//! implementation rather than baking in one database's wire format.
//!
//! Production callers implement `Driver` against their client of choice
//! (`tokio-postgres`, `sqlx`, an in-house client); tests use `MemoryDriver`.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use crate::endpoint::Endpoint;

/// One row of a result set, as an ordered list of JSON-ish values.
///
/// The router never interprets row contents; this shape is just enough to
/// let the facade return something a caller can iterate.
pub type Row = Vec<Value>;

/// The outcome of running one statement against a physical connection.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Rows returned by the statement, if any.
    pub rows: Vec<Row>,
    /// Number of rows affected, for statements that don't return rows.
    pub rows_affected: Option<u64>,
}

/// A driver-reported failure, classified so the router knows whether it may
/// retry on another replica.
#[derive(Debug, Clone)]
pub struct DriverError {
    /// Human-readable detail, preserved verbatim in the surfaced error.
    pub message: String,
    /// Whether this failure is transient (connect timeout, connection
    /// reset, statement timeout, endpoint unavailable) and therefore
    /// eligible for replica-to-replica or replica-to-primary retry.
    pub transient: bool,
}

impl DriverError {
    /// Build a transient error (eligible for retry across replicas).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// Build a non-transient error (surfaced unchanged, e.g. syntax error).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DriverError {}

/// An opaque handle to one physical connection, owned exclusively by the
/// pool while idle and by whichever caller currently holds it while active.
pub trait DriverConnection: Send + 'static {}
impl<T: Send + 'static> DriverConnection for T {}

/// Pluggable backend for physical connections and statement execution.
///
/// Implementations are expected to be cheap to clone (usually an `Arc`
/// around a client handle or connection-string template) since the pool
/// holds one `Arc<dyn Driver<Connection = C>>` shared across every endpoint.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// The physical connection type this driver manages.
    type Connection: Send + 'static;

    /// Open a new physical connection to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, DriverError>;

    /// Run a trivial statement to confirm the connection is alive.
    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), DriverError>;

    /// Execute one statement with positional parameters.
    async fn execute_raw(
        &self,
        conn: &mut Self::Connection,
        statement: &str,
        params: &[Value],
    ) -> Result<QueryOutcome, DriverError>;
}
