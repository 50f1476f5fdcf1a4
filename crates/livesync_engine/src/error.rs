//! Error types for the replica engine.

use livesync_protocol::{RemoteError, WireError};
use thiserror::Error;

/// Result type for replica operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors that can occur during replica operations.
///
/// Errors are `Clone` so a single failure can settle the shared
/// `loaded` future for every caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    /// Operation attempted after the replica was destroyed.
    #[error("cannot call {operation} on a destroyed replica")]
    Destroyed {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// Index or record does not resolve to a live member of the replica.
    #[error("invalid record reference: {0}")]
    InvalidReference(String),

    /// A second binding was requested while one is active.
    #[error("replica is already bound to a location; unbind it first")]
    AlreadyBound,

    /// The remote store reported an error.
    #[error("remote failure: {0}")]
    RemoteFailure(RemoteError),

    /// Content to be written is structurally invalid.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// No async runtime is available to drive event delivery.
    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

impl ReplicaError {
    /// Creates a destroyed error for `operation`.
    pub fn destroyed(operation: &'static str) -> Self {
        Self::Destroyed { operation }
    }

    /// Creates an invalid reference error.
    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidReference(message.into())
    }

    /// Returns true if the replica had been destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, ReplicaError::Destroyed { .. })
    }

    /// Returns true if the error came from the remote store.
    pub fn is_remote(&self) -> bool {
        matches!(self, ReplicaError::RemoteFailure(_))
    }

    /// Returns the store error, if any.
    pub fn remote_cause(&self) -> Option<&RemoteError> {
        match self {
            ReplicaError::RemoteFailure(cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<RemoteError> for ReplicaError {
    fn from(err: RemoteError) -> Self {
        ReplicaError::RemoteFailure(err)
    }
}

impl From<WireError> for ReplicaError {
    fn from(err: WireError) -> Self {
        ReplicaError::ValidationFailure(err.to_string())
    }
}
