//! Endpoint identity and health-state tracking.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Role an endpoint plays in the topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointRole {
    /// The single read-write endpoint.
    Primary,
    /// A read-only endpoint eligible for replica traffic.
    Replica,
}

/// Connection parameters for reaching one database service.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectAddress {
    /// Hostname or IP of the database service.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Database/schema name.
    pub database: String,
    /// Connecting user.
    pub user: String,
    /// Opaque reference to a secret store entry; never the secret itself.
    pub secret_ref: String,
}

/// Logical identity of a database service reachable via a URL.
///
/// Immutable after registration; destroyed only on shutdown. Weight and
/// priority are static attributes consumed by the load balancer and the
/// router's fallback ordering, respectively.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identifier, unique within a `EndpointRegistry`.
    pub id: String,
    /// Connection parameters.
    pub address: ConnectAddress,
    /// Optional region tag, used by the `geographic` load-balancing strategy.
    pub region: Option<String>,
    /// Positive integer weight, default 1. Used by weighted strategies.
    pub weight: u32,
    /// Primary or replica.
    pub role: EndpointRole,
    /// Fallback ordering among replicas; lower sorts first.
    pub priority: u32,
}

impl Endpoint {
    /// Construct a primary endpoint.
    pub fn primary(id: impl Into<String>, address: ConnectAddress) -> Self {
        Self {
            id: id.into(),
            address,
            region: None,
            weight: 1,
            role: EndpointRole::Primary,
            priority: 0,
        }
    }

    /// Construct a replica endpoint with the given weight and priority.
    pub fn replica(
        id: impl Into<String>,
        address: ConnectAddress,
        region: Option<String>,
        weight: u32,
        priority: u32,
    ) -> Self {
        Self {
            id: id.into(),
            address,
            region,
            weight: weight.max(1),
            role: EndpointRole::Replica,
            priority,
        }
    }

    /// Whether this endpoint is the primary.
    pub fn is_primary(&self) -> bool {
        matches!(self.role, EndpointRole::Primary)
    }
}

/// Mutable health status for one endpoint, updated by the Health Monitor
/// and read by the Load Balancer via a cheap snapshot.
///
/// `healthy` is false iff `consecutive_failures >= unhealthy_threshold`;
/// recovery requires exactly one successful probe (single-success
/// recovery), which prevents flapping under transient errors.
#[derive(Debug)]
pub struct EndpointState {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_probe_at: parking_lot::Mutex<Option<Instant>>,
    last_state_change_at: parking_lot::Mutex<Instant>,
    unhealthy_threshold: u32,
}

impl EndpointState {
    /// Create state for a newly registered endpoint, starting healthy.
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_probe_at: parking_lot::Mutex::new(None),
            last_state_change_at: parking_lot::Mutex::new(Instant::now()),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Current healthy/unhealthy bit.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Record a successful probe or query. Returns `true` if this
    /// transitioned the endpoint from unhealthy to healthy.
    pub fn record_success(&self) -> bool {
        *self.last_probe_at.lock() = Some(Instant::now());
        self.consecutive_failures.store(0, Ordering::Release);
        let was_unhealthy = !self.healthy.swap(true, Ordering::AcqRel);
        if was_unhealthy {
            *self.last_state_change_at.lock() = Instant::now();
        }
        was_unhealthy
    }

    /// Record a failed probe or query. Returns `true` if this transitioned
    /// the endpoint from healthy to unhealthy (i.e. the threshold was just
    /// crossed).
    pub fn record_failure(&self) -> bool {
        *self.last_probe_at.lock() = Some(Instant::now());
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.unhealthy_threshold && self.healthy.swap(false, Ordering::AcqRel) {
            *self.last_state_change_at.lock() = Instant::now();
            return true;
        }
        false
    }

    /// Time of the most recent probe, if any has run.
    pub fn last_probe_at(&self) -> Option<Instant> {
        *self.last_probe_at.lock()
    }

    /// Time of the most recent healthy/unhealthy transition.
    pub fn last_state_change_at(&self) -> Instant {
        *self.last_state_change_at.lock()
    }
}

/// Point-in-time, serializable snapshot of rolling counters maintained by
/// an `EndpointPool`, used by the Load Balancer's pure-function strategies
/// and exposed through `QueryFacade::stats`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    /// Endpoint id.
    pub endpoint_id: String,
    /// Whether the endpoint is currently healthy.
    pub healthy: bool,
    /// Optional region tag.
    pub region: Option<String>,
    /// Static weight.
    pub weight: u32,
    /// Total requests served since the pool was created.
    pub request_count: u64,
    /// Total requests that failed.
    pub error_count: u64,
    /// EWMA latency in milliseconds.
    pub ewma_latency_ms: f64,
    /// Connections currently checked out.
    pub active: u32,
    /// Connections currently idle.
    pub idle: u32,
    /// Callers currently waiting for a connection.
    pub waiters: u32,
}

/// Atomic rolling counters backing an `EndpointSnapshot`. Lives alongside
/// each `EndpointPool` and is updated on every `release`.
#[derive(Debug, Default)]
pub struct RollingCounters {
    request_count: AtomicU64,
    error_count: AtomicU64,
    ewma_latency_bits: AtomicU64,
}

/// EWMA smoothing factor applied to each new latency sample.
const EWMA_ALPHA: f64 = 0.3;

impl RollingCounters {
    /// Record the outcome of one completed statement.
    pub fn record(&self, duration: Duration, success: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        let sample = duration.as_secs_f64() * 1000.0;
        loop {
            let current_bits = self.ewma_latency_bits.load(Ordering::Relaxed);
            let current = f64::from_bits(current_bits);
            let next = if current_bits == 0 {
                sample
            } else {
                (1.0 - EWMA_ALPHA) * current + EWMA_ALPHA * sample
            };
            if self
                .ewma_latency_bits
                .compare_exchange_weak(
                    current_bits,
                    next.to_bits(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }

    /// Total requests recorded.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Total errors recorded.
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Current EWMA latency, in milliseconds (0.0 until the first sample).
    pub fn ewma_latency_ms(&self) -> f64 {
        f64::from_bits(self.ewma_latency_bits.load(Ordering::Relaxed))
    }
}
