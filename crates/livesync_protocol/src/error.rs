//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for wire conversions.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while converting records to their wire form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A key contains a reserved character or is empty.
    #[error("invalid key {key:?} (cannot be empty or contain . $ [ ] # /)")]
    InvalidKey {
        /// The offending key.
        key: String,
    },
}

impl WireError {
    /// Creates an invalid key error.
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }
}
