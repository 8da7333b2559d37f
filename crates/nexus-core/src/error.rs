//! The unified error type each subsystem converts into at the facade
//! boundary (spec.md 7), mirroring the teacher's layered `#[from]` error
//! chains (`zvault-core/src/error.rs`).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NexusError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("soft deleted")]
    SoftDeleted,

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("low entropy: {0}")]
    LowEntropy(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("kek retired: {0}")]
    KekRetired(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<nexus_storage::StorageError> for NexusError {
    fn from(e: nexus_storage::StorageError) -> Self {
        use nexus_storage::StorageError as S;
        match e {
            S::NotFound(m) => NexusError::NotFound(m),
            S::BackendUnavailable(m) => NexusError::BackendUnavailable(m),
            S::Crypto(c) => NexusError::CryptoFailure(c.to_string()),
            S::Cancelled => NexusError::Cancelled,
            S::Timeout(d) => NexusError::Timeout(d),
            S::BadInput(m) => NexusError::BadInput(m),
            S::Internal(m) => NexusError::Internal(m),
        }
    }
}

impl From<nexus_storage::CryptoError> for NexusError {
    fn from(e: nexus_storage::CryptoError) -> Self {
        NexusError::CryptoFailure(e.to_string())
    }
}
