use thiserror::Error;

/// Failure taxonomy for the storage subsystem.
///
/// `Busy` is transient and absorbed by the engine's retry loop before it ever
/// reaches a caller; `Corrupt` marks structural damage handled by the recovery
/// path; `ConstraintViolation` is a caller logic error and is never retried;
/// `StorageUnavailable` means the database file cannot be opened at all.
#[derive(Debug, Error)]
pub enum EmberError {
    #[error("database busy: {0}")]
    Busy(String),
    #[error("database corrupt: {0}")]
    Corrupt(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("rate limited: try again later")]
    RateLimited,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub use crate::Result;

impl EmberError {
    /// Transient contention that is worth another attempt.
    pub fn is_busy(&self) -> bool {
        matches!(self, EmberError::Busy(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, EmberError::Corrupt(_))
    }
}
