//! Failure taxonomy for the coordination substrate.
//!
//! Transient errors are bus-redelivery eligible; malformed messages skip
//! retries and go straight to the dead-letter topic. Admission outcomes
//! (DEFERRED/REJECTED) are not errors and live in `admission::PredictOutcome`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("blob not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("size mismatch for {key}: pointer says {expected} bytes, store returned {actual}")]
    SizeMismatch { key: String, expected: u64, actual: u64 },

    #[error("registry failure: {0}")]
    Registry(String),

    #[error("bus failure: {0}")]
    Bus(String),
}

/// Returned by bus handlers to steer redelivery: transient failures are
/// retried up to the policy limit, malformed ones are dead-lettered at once.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Malformed(String),
}

impl HandlerError {
    pub fn transient(detail: impl std::fmt::Display) -> Self {
        Self::Transient(detail.to_string())
    }

    pub fn malformed(detail: impl std::fmt::Display) -> Self {
        Self::Malformed(detail.to_string())
    }
}

impl From<CoordinationError> for HandlerError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Malformed(d) => HandlerError::Malformed(d),
            other => HandlerError::Transient(other.to_string()),
        }
    }
}
