//! Metrics Sink: concurrency-safe aggregation of query outcomes and pool
//! snapshots, plus an event bus for slow-query, error, and pool-pressure
//! notifications.
//!
//! Recording never blocks the hot path for more than O(1) and never
//! surfaces an error to the caller; any internal failure (e.g. a panicking
//! subscriber) is logged and the offending subscriber is dropped.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::endpoint::EndpointSnapshot;

/// One completed statement, as recorded by an `EndpointPool`.
#[derive(Clone, Debug)]
pub struct QueryMetric {
    /// Statement text, recorded verbatim; use [`normalize_pattern`] to group
    /// by shape.
    pub statement: String,
    /// Endpoint the statement ran against.
    pub endpoint_id: String,
    /// Wall-clock duration of the statement.
    pub duration: Duration,
    /// Whether the statement completed successfully.
    pub success: bool,
    /// Row count, when meaningful for the statement kind.
    pub row_count: Option<u64>,
    /// Driver error code, when `success` is false.
    pub error_code: Option<String>,
    /// When the statement completed.
    pub timestamp: Instant,
}

/// Aggregate performance figures computed over the retention window.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Mean duration across all queries in the window, in milliseconds.
    pub average_latency_ms: f64,
    /// Count of queries at or above the slow threshold.
    pub slow_count: u64,
    /// Total queries recorded in the window.
    pub total: u64,
    /// Fraction of queries in the window that failed.
    pub error_rate: f64,
    /// Mean `active / (active + idle)` across the latest per-endpoint
    /// snapshots.
    pub utilization: f64,
}

/// Aggregated counters for one normalized query shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PatternStats {
    /// Number of times this shape was executed.
    pub count: u64,
    /// Mean duration for this shape, in milliseconds.
    pub avg_duration_ms: f64,
    /// Number of failures for this shape.
    pub errors: u64,
}

/// The kinds of events external telemetry collectors can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A query completed (success or failure).
    QueryExecuted,
    /// A query met or exceeded the slow threshold.
    SlowQuery,
    /// A query failed.
    QueryError,
    /// An endpoint crossed into unhealthy.
    EndpointFailed,
    /// An endpoint recovered to healthy.
    EndpointRecovered,
    /// A pool reported waiters.
    PoolSaturation,
    /// A pool's active/total ratio crossed the high-utilization threshold.
    PoolHighUtilization,
    /// A pool's bounds were resized by the optimizer.
    PoolResize,
    /// A routing decision was made (sampled).
    RoutingDecision,
}

/// Payload carried by one emitted event.
#[derive(Clone, Debug)]
pub enum RouterEvent {
    /// A query completed, successfully or not.
    QueryExecuted {
        /// Endpoint the query ran against.
        endpoint_id: String,
        /// Duration of the query.
        duration: Duration,
        /// Whether it succeeded.
        success: bool,
        /// Row count, if known.
        rows: Option<u64>,
    },
    /// A query met or exceeded the slow threshold.
    SlowQuery(QueryMetric),
    /// A query failed.
    QueryError(QueryMetric),
    /// An endpoint crossed into unhealthy.
    EndpointFailed {
        /// Endpoint that crossed into unhealthy.
        endpoint_id: String,
        /// Consecutive failures observed at the moment of transition.
        consecutive_failures: u32,
    },
    /// An endpoint recovered to healthy.
    EndpointRecovered {
        /// Endpoint that recovered.
        endpoint_id: String,
    },
    /// A pool reported callers waiting for a connection.
    PoolSaturation {
        /// Endpoint whose pool reported waiters.
        endpoint_id: String,
        /// Waiter count at the moment of the snapshot.
        waiters: u32,
    },
    /// A pool's active/total ratio crossed the high-utilization threshold.
    PoolHighUtilization {
        /// Endpoint whose pool crossed the utilization threshold.
        endpoint_id: String,
        /// `active / (active + idle)` at the moment of the snapshot.
        ratio: f64,
    },
    /// A pool's bounds were resized by the optimizer.
    PoolResize {
        /// Endpoint whose bounds were changed.
        endpoint_id: String,
        /// Previous `max_size`.
        old_max: u32,
        /// New `max_size`.
        new_max: u32,
    },
    /// A routing decision was made (sampled upstream).
    RoutingDecision {
        /// Correlating request id.
        request_id: u64,
        /// Human-readable decision summary (target + reason).
        decision: String,
    },
}

impl RouterEvent {
    fn kind(&self) -> EventKind {
        match self {
            RouterEvent::QueryExecuted { .. } => EventKind::QueryExecuted,
            RouterEvent::SlowQuery(_) => EventKind::SlowQuery,
            RouterEvent::QueryError(_) => EventKind::QueryError,
            RouterEvent::EndpointFailed { .. } => EventKind::EndpointFailed,
            RouterEvent::EndpointRecovered { .. } => EventKind::EndpointRecovered,
            RouterEvent::PoolSaturation { .. } => EventKind::PoolSaturation,
            RouterEvent::PoolHighUtilization { .. } => EventKind::PoolHighUtilization,
            RouterEvent::PoolResize { .. } => EventKind::PoolResize,
            RouterEvent::RoutingDecision { .. } => EventKind::RoutingDecision,
        }
    }
}

type Handler = Box<dyn Fn(&RouterEvent) + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
}

/// Utilization ratio at or above which `record_pool_snapshot` publishes
/// `PoolHighUtilization`.
const HIGH_UTILIZATION_THRESHOLD: f64 = 0.8;

/// Single, concurrency-safe aggregation point for query outcomes and pool
/// snapshots, plus the event bus described above.
pub struct MetricsSink {
    window: Duration,
    slow_threshold: Duration,
    queries: Mutex<VecDeque<QueryMetric>>,
    snapshots: RwLock<HashMap<String, EndpointSnapshot>>,
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_subscription_id: AtomicU64,
}

impl MetricsSink {
    /// Create a sink with the given rolling retention window and slow-query
    /// threshold.
    pub fn new(window: Duration, slow_threshold: Duration) -> Self {
        Self {
            window,
            slow_threshold,
            queries: Mutex::new(VecDeque::new()),
            snapshots: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Append a completed query to the rolling window, pruning anything
    /// older than the window, and publish `SlowQuery`/`QueryError` as
    /// appropriate.
    pub fn record_query(&self, metric: QueryMetric) {
        {
            let mut queries = self.queries.lock();
            queries.push_back(metric.clone());
            Self::prune_locked(&mut queries, self.window);
        }

        self.publish(RouterEvent::QueryExecuted {
            endpoint_id: metric.endpoint_id.clone(),
            duration: metric.duration,
            success: metric.success,
            rows: metric.row_count,
        });

        if metric.duration >= self.slow_threshold {
            self.publish(RouterEvent::SlowQuery(metric.clone()));
        }
        if !metric.success {
            self.publish(RouterEvent::QueryError(metric));
        }
    }

    /// Store the latest per-endpoint pool snapshot, publishing
    /// `PoolHighUtilization`/`PoolSaturation` when thresholds are crossed.
    pub fn record_pool_snapshot(&self, snapshot: EndpointSnapshot) {
        let total = snapshot.active + snapshot.idle;
        let ratio = if total == 0 {
            0.0
        } else {
            snapshot.active as f64 / total as f64
        };
        let waiters = snapshot.waiters;
        let endpoint_id = snapshot.endpoint_id.clone();

        self.snapshots.write().insert(endpoint_id.clone(), snapshot);

        if ratio >= HIGH_UTILIZATION_THRESHOLD {
            self.publish(RouterEvent::PoolHighUtilization {
                endpoint_id: endpoint_id.clone(),
                ratio,
            });
        }
        if waiters > 0 {
            self.publish(RouterEvent::PoolSaturation {
                endpoint_id,
                waiters,
            });
        }
    }

    /// Emit a `PoolResize` event (the optimizer calls this directly since a
    /// resize isn't itself a snapshot).
    pub fn record_resize(&self, endpoint_id: impl Into<String>, old_max: u32, new_max: u32) {
        self.publish(RouterEvent::PoolResize {
            endpoint_id: endpoint_id.into(),
            old_max,
            new_max,
        });
    }

    /// Emit a sampled `RoutingDecision` event.
    pub fn record_routing_decision(&self, request_id: u64, decision: impl Into<String>) {
        self.publish(RouterEvent::RoutingDecision {
            request_id,
            decision: decision.into(),
        });
    }

    /// Emit `EndpointFailed`.
    pub fn record_endpoint_failed(&self, endpoint_id: impl Into<String>, consecutive_failures: u32) {
        self.publish(RouterEvent::EndpointFailed {
            endpoint_id: endpoint_id.into(),
            consecutive_failures,
        });
    }

    /// Emit `EndpointRecovered`.
    pub fn record_endpoint_recovered(&self, endpoint_id: impl Into<String>) {
        self.publish(RouterEvent::EndpointRecovered {
            endpoint_id: endpoint_id.into(),
        });
    }

    /// Aggregate performance figures over the retention window.
    pub fn performance(&self) -> PerformanceSummary {
        let queries = self.queries.lock();
        let total = queries.len() as u64;
        if total == 0 {
            return PerformanceSummary {
                utilization: self.average_utilization(),
                ..Default::default()
            };
        }

        let mut sum_ms = 0.0;
        let mut slow_count = 0u64;
        let mut errors = 0u64;
        for q in queries.iter() {
            sum_ms += q.duration.as_secs_f64() * 1000.0;
            if q.duration >= self.slow_threshold {
                slow_count += 1;
            }
            if !q.success {
                errors += 1;
            }
        }

        PerformanceSummary {
            average_latency_ms: sum_ms / total as f64,
            slow_count,
            total,
            error_rate: errors as f64 / total as f64,
            utilization: self.average_utilization(),
        }
    }

    fn average_utilization(&self) -> f64 {
        let snapshots = self.snapshots.read();
        if snapshots.is_empty() {
            return 0.0;
        }
        let sum: f64 = snapshots
            .values()
            .map(|s| {
                let total = s.active + s.idle;
                if total == 0 {
                    0.0
                } else {
                    s.active as f64 / total as f64
                }
            })
            .sum();
        sum / snapshots.len() as f64
    }

    /// Top-`limit` queries by duration within the retention window.
    pub fn slow_queries(&self, limit: usize) -> Vec<QueryMetric> {
        let queries = self.queries.lock();
        let mut sorted: Vec<_> = queries.iter().cloned().collect();
        sorted.sort_by(|a, b| b.duration.cmp(&a.duration));
        sorted.truncate(limit);
        sorted
    }

    /// Query-shape aggregation: statements are grouped by their normalized
    /// pattern (see [`normalize_pattern`]) into `{count, avg_duration,
    /// errors}`.
    pub fn by_pattern(&self) -> HashMap<String, PatternStats> {
        let queries = self.queries.lock();
        let mut acc: HashMap<String, (u64, f64, u64)> = HashMap::new();
        for q in queries.iter() {
            let pattern = normalize_pattern(&q.statement);
            let entry = acc.entry(pattern).or_insert((0, 0.0, 0));
            entry.0 += 1;
            entry.1 += q.duration.as_secs_f64() * 1000.0;
            if !q.success {
                entry.2 += 1;
            }
        }
        acc.into_iter()
            .map(|(pattern, (count, sum_ms, errors))| {
                (
                    pattern,
                    PatternStats {
                        count,
                        avg_duration_ms: sum_ms / count as f64,
                        errors,
                    },
                )
            })
            .collect()
    }

    /// Register a non-blocking callback for `event_kind`. Returns a
    /// subscription id that can be used with `unsubscribe`. A handler that
    /// panics is logged and unsubscribed on the spot.
    pub fn subscribe(&self, event_kind: EventKind, handler: Handler) -> u64 {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(event_kind)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Remove a previously registered subscription.
    pub fn unsubscribe(&self, event_kind: EventKind, id: u64) {
        if let Some(subs) = self.subscribers.write().get_mut(&event_kind) {
            subs.retain(|s| s.id != id);
        }
    }

    fn publish(&self, event: RouterEvent) {
        let kind = event.kind();
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read();
            if let Some(subs) = subscribers.get(&kind) {
                for sub in subs {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event)));
                    if result.is_err() {
                        warn!(subscription_id = sub.id, "metrics subscriber panicked, unsubscribing");
                        dead.push(sub.id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            if let Some(subs) = self.subscribers.write().get_mut(&kind) {
                subs.retain(|s| !dead.contains(&s.id));
            }
        }
    }

    fn prune_locked(queries: &mut VecDeque<QueryMetric>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = queries.front() {
            if now.duration_since(front.timestamp) > window {
                queries.pop_front();
            } else {
                break;
            }
        }
    }
}

static PATTERN_RULES: Lazy<(Regex, Regex, Regex)> = Lazy::new(|| {
    (
        Regex::new(r"\$\d+|\?|:[A-Za-z_][A-Za-z0-9_]*").unwrap(),
        Regex::new(r"'(?:[^']|'')*'").unwrap(),
        Regex::new(r"\b\d+\b").unwrap(),
    )
});

/// Replace literal parameter markers (`$1`, `?`, `:name`), quoted strings,
/// and bare integer literals with a single `?` placeholder, so that
/// structurally identical statements aggregate together in `by_pattern`.
pub fn normalize_pattern(statement: &str) -> String {
    let (markers, strings, integers) = &*PATTERN_RULES;
    let step1 = markers.replace_all(statement, "?");
    let step2 = strings.replace_all(&step1, "?");
    let step3 = integers.replace_all(&step2, "?");
    step3.into_owned()
}

/// Shared handle to a `MetricsSink`, the shape every other component holds.
pub type SharedMetrics = Arc<MetricsSink>;
