use thiserror::Error;

/// Errors returned by apimeter operations.
///
/// All failures are local and synchronous; nothing in the core retries
/// automatically. `Inconsistent` signals a violated internal invariant and
/// requires operator attention rather than silent correction.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("nothing to settle")]
    NothingToSettle,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal inconsistency: {0}")]
    Inconsistent(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
