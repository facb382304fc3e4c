//! Engine error types

use thiserror::Error;

/// Closed classification of venue rejections
///
/// Each call site picks its shrink/backoff policy off this kind instead of
/// matching on venue error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueErrorKind {
    /// Not enough isolated margin for the requested notional
    MarginInsufficient,
    /// Reduce-only order would increase the position
    ReduceOnlyRejected,
    /// Request-weight or order-rate limit hit
    RateLimited,
    /// Network or 5xx failure, safe to retry
    Transient,
    /// Anything the engine must not retry blindly
    Fatal,
}

/// A failed venue operation
#[derive(Error, Debug, Clone)]
#[error("venue error ({kind:?}): {message}")]
pub struct VenueError {
    pub kind: VenueErrorKind,
    pub message: String,
}

impl VenueError {
    pub fn new(kind: VenueErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(VenueErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(VenueErrorKind::Fatal, message)
    }

    /// Whether a plain backoff-and-retry is appropriate
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            VenueErrorKind::Transient | VenueErrorKind::RateLimited
        )
    }
}

/// Errors that can occur in the grid engine
#[derive(Error, Debug)]
pub enum GridError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Venue(#[from] VenueError),

    #[error("state file corrupt: {0}")]
    StateCorrupt(String),

    #[error("state persistence error: {0}")]
    StatePersistence(String),

    #[error("trade journal error: {0}")]
    Journal(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("ladder error: {0}")]
    Ladder(String),
}

impl GridError {
    /// Process exit code for a fatal occurrence of this error
    pub fn exit_code(&self) -> i32 {
        match self {
            GridError::InvalidConfig(_) => 1,
            GridError::Venue(_) | GridError::WebSocket(_) => 2,
            GridError::StateCorrupt(_) => 3,
            _ => 2,
        }
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::StateCorrupt(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(VenueError::transient("timeout").is_retryable());
        assert!(VenueError::new(VenueErrorKind::RateLimited, "429").is_retryable());
        assert!(!VenueError::fatal("bad request").is_retryable());
        assert!(!VenueError::new(VenueErrorKind::MarginInsufficient, "-2019").is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(GridError::InvalidConfig("x".into()).exit_code(), 1);
        assert_eq!(GridError::StateCorrupt("x".into()).exit_code(), 3);
        assert_eq!(
            GridError::Venue(VenueError::fatal("x")).exit_code(),
            2
        );
    }
}
