//! Error types for the gateway and the coordination facade.
//!
//! `GatewayError` is what a backend implementation reports. `CoordinationError`
//! is what callers of the facade see; gateway failures are folded into it with
//! the node or watch context attached.

use snafu::Snafu;
use thiserror::Error;

/// Errors reported by a [`crate::gateway::BackendGateway`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Transport or connection failure talking to the backend.
    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },
    /// The backend refused the request as malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("key size {size} exceeds maximum of {max} bytes")]
    KeyTooLarge { size: usize, max: usize },
    #[error("value size {size} exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },
}

impl GatewayError {
    /// Shorthand for a transport failure.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        GatewayError::BackendUnavailable { reason: reason.into() }
    }
}

/// Errors from facade operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The backend could not be reached. Never retried by this layer.
    #[snafu(display("backend unavailable: {reason}"))]
    BackendUnavailable {
        /// Description of the transport failure.
        reason: String,
    },

    /// Fetching one node's services failed, aborting the whole aggregation.
    #[snafu(display("service fetch for node '{node}' failed: {source}"))]
    NodeFetchFailed {
        /// Node whose fetch failed.
        node: String,
        /// The underlying gateway error.
        source: GatewayError,
    },

    /// A watch's error channel fired. Terminal for that watch.
    #[snafu(display("watch failed: {reason}"))]
    WatchFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// A guarded write was rejected because the modify index moved.
    #[snafu(display("CAS conflict on key '{key}' (expected modify index {expected_index})"))]
    CasConflict {
        /// The contended key.
        key: String,
        /// Index the writer expected to find.
        expected_index: u64,
    },

    /// Lock is held by another holder.
    #[snafu(display("lock '{key}' is held by another holder"))]
    LockHeld {
        /// The lock key.
        key: String,
    },

    /// Lock was lost before it could be released.
    #[snafu(display("lock '{key}' was lost by '{holder}'"))]
    LockLost {
        /// The lock key.
        key: String,
        /// Holder that expected to own it.
        holder: String,
    },

    /// Operation timed out.
    #[snafu(display("operation timed out: {operation}"))]
    Timeout {
        /// Description of the operation.
        operation: String,
    },

    /// Caller passed an argument the facade refuses to forward.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        /// What was wrong with it.
        reason: String,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("serialization error for key '{key}': {source}"))]
    Serialization {
        /// Key whose value failed to (de)serialize.
        key: String,
        /// The underlying error.
        source: serde_json::Error,
    },
}

impl CoordinationError {
    /// True for transport failures the caller may choose to retry.
    pub fn is_backend_unavailable(&self) -> bool {
        match self {
            CoordinationError::BackendUnavailable { .. } => true,
            CoordinationError::NodeFetchFailed { source, .. } => {
                matches!(source, GatewayError::BackendUnavailable { .. })
            }
            _ => false,
        }
    }
}

impl From<GatewayError> for CoordinationError {
    fn from(source: GatewayError) -> Self {
        match source {
            GatewayError::BackendUnavailable { reason } => CoordinationError::BackendUnavailable { reason },
            other => CoordinationError::InvalidArgument {
                reason: other.to_string(),
            },
        }
    }
}
