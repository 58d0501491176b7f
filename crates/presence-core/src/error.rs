use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("feature vector has {actual} dimensions, registry expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid feature vector: {0}")]
    InvalidVector(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("deadline exceeded after {elapsed:?}")]
    Timeout { elapsed: Duration },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("feature extraction failed: {0}")]
    Extraction(String),
}

impl Error {
    /// Stable short label, used in per-face status strings.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DimensionMismatch { .. } => "dimension-mismatch",
            Error::InvalidVector(_) => "invalid-vector",
            Error::UnknownIdentity(_) => "unknown-identity",
            Error::DuplicateIdentity(_) => "duplicate-identity",
            Error::InvalidIdentity(_) => "invalid-identity",
            Error::Timeout { .. } => "timeout",
            Error::StorageUnavailable(_) => "storage-unavailable",
            Error::Extraction(_) => "extraction",
        }
    }

    /// Whether retrying the whole recognition cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::StorageUnavailable(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
