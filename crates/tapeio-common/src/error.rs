//! Error types for TapeIO
//!
//! Errors fall into a handful of families: validation of caller input,
//! referential consistency violations, storage and IO failures, cache
//! capacity exhaustion, lookups of unknown entities and internal
//! concurrency conflicts.

use thiserror::Error;

/// Common result type for TapeIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for TapeIO
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("illegal name: {0}")]
    IllegalName(String),

    // Referential consistency errors
    #[error("referential consistency error: {0}")]
    ReferentialConsistency(String),

    #[error("entity already exists: {0}")]
    AlreadyExists(String),

    #[error("illegal state transition for {id}: {from} -> {to}")]
    IllegalStateTransition {
        id: String,
        from: String,
        to: String,
    },

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file length mismatch for {path}: expected {expected} bytes, found {actual}")]
    FileLengthMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("not a regular file: {0}")]
    NotRegularFile(String),

    #[error("truncated tar archive: {0}")]
    TruncatedTar(String),

    #[error("digest mismatch for {entry}: expected {expected}, got {actual}")]
    DigestMismatch {
        entry: String,
        expected: String,
        actual: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    // Capacity errors
    #[error("cache capacity exceeded: required {required} bytes, usage {usage} of {max} bytes")]
    CapacityExceeded { required: u64, usage: u64, max: u64 },

    // Lookup errors
    #[error("object not found: {container}/{object}")]
    ObjectNotFound { container: String, object: String },

    #[error("access request not found: {0}")]
    AccessRequestNotFound(String),

    // Concurrency errors
    #[error("concurrent update could not be applied after {attempts} attempts: {id}")]
    ConcurrentUpdate { id: String, attempts: u32 },

    // Generic errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a referential consistency error
    pub fn referential(msg: impl Into<String>) -> Self {
        Self::ReferentialConsistency(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Bad caller input, never worth retrying
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::InvalidRequest(_) | Self::IllegalName(_)
        )
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::FileLengthMismatch { .. } | Self::ConcurrentUpdate { .. }
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotFound { .. } | Self::AccessRequestNotFound(_)
        )
    }

    /// Check if this error signals a broken referential invariant
    #[must_use]
    pub const fn is_referential(&self) -> bool {
        matches!(
            self,
            Self::ReferentialConsistency(_)
                | Self::AlreadyExists(_)
                | Self::IllegalStateTransition { .. }
        )
    }
}
