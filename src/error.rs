//! Error taxonomy for the query router.

use thiserror::Error;

/// Errors that can occur anywhere in the router.
///
/// Variants correspond to the error kinds enumerated in the router's design:
/// configuration failures are fatal at startup, pool/acquire errors surface
/// unchanged to callers, and driver-reported errors carry the driver's own
/// message through unmodified.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration was rejected at construction time. Never retried.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A deadline elapsed while waiting for a pool slot.
    #[error("timed out acquiring a connection to endpoint {endpoint}")]
    AcquireTimeout {
        /// Endpoint id the caller was waiting on.
        endpoint: String,
    },

    /// The caller's deadline or an external cancellation fired while waiting.
    #[error("acquire cancelled for endpoint {endpoint}")]
    AcquireCancelled {
        /// Endpoint id the caller was waiting on.
        endpoint: String,
    },

    /// `force_replica` was requested but no replica is currently healthy.
    #[error("no healthy replica available")]
    NoReplicaAvailable,

    /// A driver-level connect/reset/timeout error, convertible to a retry or
    /// primary fallback by the router.
    #[error("endpoint {endpoint} transient error: {message}")]
    EndpointTransient {
        /// Endpoint id that raised the error.
        endpoint: String,
        /// Driver-supplied detail.
        message: String,
    },

    /// A non-transient, driver-reported error (syntax, constraint,
    /// permission). Surfaced to the caller unchanged.
    #[error("statement error on endpoint {endpoint}: {message}")]
    StatementError {
        /// Endpoint id the statement ran against.
        endpoint: String,
        /// Driver-supplied detail, preserved verbatim.
        message: String,
    },

    /// The facade or pool has begun or completed shutdown.
    #[error("pool closed")]
    PoolClosed,

    /// A connection was released twice, or released without having been
    /// acquired. This is a caller programming error.
    #[error("illegal release of connection {connection_id} on endpoint {endpoint}")]
    IllegalRelease {
        /// Connection id involved in the double release.
        connection_id: u64,
        /// Endpoint id owning the connection.
        endpoint: String,
    },

    /// Creating a new physical connection failed.
    #[error("failed to create connection to endpoint {endpoint}: {message}")]
    ConnectionCreateFailed {
        /// Endpoint id the connection attempt targeted.
        endpoint: String,
        /// Driver-supplied detail.
        message: String,
    },

    /// All configured replicas failed and fallback to primary was not
    /// permitted, or also failed.
    #[error("all replicas failed: {0}")]
    AllReplicasFailed(String),
}

impl RouterError {
    /// Whether this error kind is classified as "endpoint transient" for the
    /// purposes of the router's retry policy (connect timeout, connection
    /// reset, statement timeout, endpoint unavailable).
    pub fn is_transient(&self) -> bool {
        matches!(self, RouterError::EndpointTransient { .. })
    }
}
