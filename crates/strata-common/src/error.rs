//! Error types shared across Strata crates.

use crate::version::SchemaVersion;
use thiserror::Error;

/// Errors raised while validating versioned record headers.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Magic bytes did not match the expected tag
    #[error("bad magic bytes: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// Tag the reader expected
        expected: [u8; 4],
        /// Tag found in the data
        found: [u8; 4],
    },

    /// Record was written by an incompatible schema version
    #[error("schema version mismatch: data {found}, reader {expected}")]
    SchemaMismatch {
        /// Version found in the data
        found: SchemaVersion,
        /// Version the reader understands
        expected: SchemaVersion,
    },
}

/// Result type alias for common operations.
pub type CommonResult<T> = Result<T, CommonError>;
