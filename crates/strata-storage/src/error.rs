//! Error types for storage operations.

use strata_common::CommonError;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    /// Versioned record header was rejected
    #[error("Record header rejected: {0}")]
    RecordHeader(#[from] CommonError),

    /// Compression or decompression failed
    #[error("Codec {codec} failed: {detail}")]
    Codec {
        /// Codec name
        codec: &'static str,
        /// Failure description
        detail: String,
    },

    /// Version byte does not name a known codec
    #[error("Unknown codec id {0}")]
    UnknownCodec(u8),

    /// Custom codec name is not registered
    #[error("Unregistered codec name: {0}")]
    UnregisteredCodec(String),

    /// Packed index stream does not match the declared geometry
    #[error("Packed storage length mismatch: expected {expected} words, found {found}")]
    StorageGeometry {
        /// Word count the geometry requires
        expected: usize,
        /// Word count actually supplied
        found: usize,
    },

    /// Packed container snapshot is internally inconsistent
    #[error("Invalid container snapshot: {0}")]
    InvalidSnapshot(String),

    /// Worker thread stopped before completing the request
    #[error("IO worker stopped before completing the request")]
    WorkerStopped,
}

impl StorageError {
    /// Best-effort duplicate for fanning one failure out to several waiters.
    ///
    /// `std::io::Error` and `bincode::Error` are not `Clone`; those variants
    /// keep their kind/message but lose the original source chain.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Serialization(e) => Self::Serialization(Box::new(bincode::ErrorKind::Custom(
                e.to_string(),
            ))),
            Self::RecordHeader(e) => match e {
                CommonError::BadMagic { expected, found } => Self::RecordHeader(CommonError::BadMagic {
                    expected: *expected,
                    found: *found,
                }),
                CommonError::SchemaMismatch { found, expected } => {
                    Self::RecordHeader(CommonError::SchemaMismatch {
                        found: *found,
                        expected: *expected,
                    })
                },
            },
            Self::Codec { codec, detail } => Self::Codec {
                codec,
                detail: detail.clone(),
            },
            Self::UnknownCodec(id) => Self::UnknownCodec(*id),
            Self::UnregisteredCodec(name) => Self::UnregisteredCodec(name.clone()),
            Self::StorageGeometry { expected, found } => Self::StorageGeometry {
                expected: *expected,
                found: *found,
            },
            Self::InvalidSnapshot(detail) => Self::InvalidSnapshot(detail.clone()),
            Self::WorkerStopped => Self::WorkerStopped,
        }
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::UnknownCodec(9);
        assert!(!err.to_string().is_empty());

        let err = StorageError::UnregisteredCodec("snappy".to_string());
        assert!(err.to_string().contains("snappy"));
    }

    #[test]
    fn test_replicate_keeps_io_kind() {
        let original = StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing region",
        ));
        let copy = original.replicate();
        match copy {
            StorageError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected variant: {other}"),
        }
    }
}
