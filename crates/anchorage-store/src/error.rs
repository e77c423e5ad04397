//! Error types for the backing store layer.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Errors from the port allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Every port in the range refused a bind probe.
    #[error("no bindable port in range {lo}-{hi}")]
    NoPortAvailable { lo: u16, hi: u16 },

    /// The range is empty or starts at port 0.
    #[error("invalid port range {lo}-{hi}")]
    InvalidRange { lo: u16, hi: u16 },
}

/// Errors raised by the lifecycle controller.
///
/// These are `Clone` because the readiness gate hands the same outcome to
/// every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Port(#[from] PortError),

    /// The allocated port was taken between the probe and the launch.
    #[error("port {port} was taken before the backing store could bind it")]
    PortInUse { port: u16 },

    /// The backing process could not be started.
    #[error("failed to launch backing store: {message}")]
    Launch { message: String },

    /// The backing process could not be stopped.
    #[error("failed to stop backing store: {message}")]
    Terminate { message: String },

    /// The backing store never answered its liveness endpoint in time.
    #[error("backing store at {endpoint} not healthy after {waited:?}: {last_error}")]
    ProvisioningTimeout {
        endpoint: String,
        waited: Duration,
        last_error: String,
    },

    /// The configuration cannot describe a usable backend.
    #[error("invalid backing store configuration: {0}")]
    Misconfigured(String),

    /// The controller has been shut down.
    #[error("backing store controller is stopped")]
    Stopped,

    /// The backend stopped answering probes for longer than the degraded
    /// timeout.
    #[error("backing store at {endpoint} unreachable for {down_for:?}")]
    BackendUnavailable { endpoint: String, down_for: Duration },

    /// An operation was attempted before the controller became ready.
    #[error("backing store is not ready (state: {state})")]
    NotReady { state: LifecycleState },
}

impl LifecycleError {
    /// Returns `true` for failures that must stop the process rather than
    /// be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Port(_)
                | Self::Launch { .. }
                | Self::ProvisioningTimeout { .. }
                | Self::Misconfigured(_)
        )
    }

    /// Returns `true` when the error is transient and the operation may
    /// succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::NotReady { .. })
    }
}

/// Errors from backing store client calls.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The backing store answered with a non-success status.
    #[error("backing store returned HTTP {status} for {operation}: {message}")]
    Http {
        operation: String,
        status: u16,
        message: String,
    },

    /// A response body could not be decoded.
    #[error("could not parse backing store response for {operation}: {message}")]
    Parse { operation: String, message: String },

    /// The named collection does not exist.
    #[error("collection not found: {collection}")]
    CollectionNotFound { collection: String },

    /// A vector does not fit the collection it was written to.
    #[error("vector of width {actual} does not fit collection {collection} (width {expected})")]
    WidthMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    /// An error propagated from `reqwest`.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl StoreError {
    /// Returns `true` when the error is transient and the operation may
    /// succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Lifecycle(e) => e.is_transient(),
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Request(e) => e.is_timeout() || e.is_connect(),
            Self::Parse { .. } | Self::CollectionNotFound { .. } | Self::WidthMismatch { .. } => {
                false
            }
        }
    }

    /// Returns `true` when the error indicates the collection was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CollectionNotFound { .. })
    }
}

/// Convenience alias for backing store results.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
