//! Typed errors surfaced at the gateway boundary.
//!
//! Internals run on `anyhow`; callers of `process_turn`, the reasoning entry
//! points and the management helpers get a `GatewayError` they can match on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Caller misuse: empty turn, last message not from the user, blank input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// `SessionStore::create` hit the uniqueness constraint.
    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage: {0}")]
    Storage(#[source] anyhow::Error),

    /// The generator failed on an explicitly invoked reasoning operation.
    #[error("generation failed: {0}")]
    Generation(#[source] anyhow::Error),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// True when an `anyhow` chain carries a `SessionExists` error.
    pub fn is_session_exists(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<GatewayError>(), Some(GatewayError::SessionExists(_)))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<GatewayError>() {
            Ok(typed) => typed,
            Err(other) => Self::Storage(other),
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
