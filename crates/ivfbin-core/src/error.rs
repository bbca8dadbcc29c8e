//! Error types for `ivfbin`.
//!
//! This module provides a unified error type for all index operations.
//! Every error is surfaced synchronously to the caller of the operation
//! that triggered it.

use thiserror::Error;

/// Result type alias for `ivfbin` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in index operations.
///
/// Error codes follow the pattern `IVFBIN-XXX` for easy debugging.
#[derive(Error, Debug)]
pub enum Error {
    /// Code width does not match the configured dimension (IVFBIN-001).
    ///
    /// Both values are expressed in bits.
    #[error("[IVFBIN-001] Code dimension mismatch: expected {expected} bits, got {actual}")]
    DimensionMismatch {
        /// Expected dimension in bits.
        expected: usize,
        /// Actual dimension in bits.
        actual: usize,
    },

    /// Coarse quantizer is not trained (IVFBIN-002).
    #[error("[IVFBIN-002] Coarse quantizer is not trained")]
    NotTrained,

    /// Invalid argument (IVFBIN-003).
    #[error("[IVFBIN-003] Invalid argument: {0}")]
    InvalidArgument(String),

    /// Vector id not stored in the index (IVFBIN-004).
    #[error("[IVFBIN-004] Vector with id '{0}' not found")]
    NotFound(i64),

    /// Device allocation failed (IVFBIN-005).
    #[error(
        "[IVFBIN-005] Device out of memory: requested {requested} bytes, {available} available"
    )]
    DeviceOutOfMemory {
        /// Bytes requested by the failing allocation.
        requested: usize,
        /// Bytes still available when the allocation was attempted.
        available: usize,
    },

    /// Compute or transfer failure on the device (IVFBIN-006).
    ///
    /// Fatal for the current call only.
    #[error("[IVFBIN-006] Device execution failure: {0}")]
    DeviceExecution(String),

    /// Configuration error (IVFBIN-007).
    #[error("[IVFBIN-007] Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the error code (e.g., "IVFBIN-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "IVFBIN-001",
            Self::NotTrained => "IVFBIN-002",
            Self::InvalidArgument(_) => "IVFBIN-003",
            Self::NotFound(_) => "IVFBIN-004",
            Self::DeviceOutOfMemory { .. } => "IVFBIN-005",
            Self::DeviceExecution(_) => "IVFBIN-006",
            Self::Config(_) => "IVFBIN-007",
        }
    }

    /// Returns true if this error is a caller contract violation.
    ///
    /// Such errors are never retried internally.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. } | Self::NotTrained | Self::InvalidArgument(_)
        )
    }

    /// Returns true if the operation may succeed with a smaller working set.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceOutOfMemory { .. })
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
