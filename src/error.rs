//! Error types for the Argus orchestration core.
//!
//! `ArgusError` is the structured error every handler returns to its caller. The
//! consumption loop uses [`ArgusError::is_retryable`] to decide whether a bus message
//! is acknowledged or left for redelivery.

use crate::domain::BatchStatus;
use crate::messaging::MessagingError;
use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArgusError {
    /// Bad input to construction or registration. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Illegal lifecycle edge. Never retried.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: BatchStatus, to: BatchStatus },

    /// Operation not permitted in the aggregate's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Batch not found: {0}")]
    NotFound(Uuid),

    /// Store or bus unavailable.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Retries exhausted while publishing; `published` leading events made it out.
    #[error("Event publication failed after {published} delivered events: {reason}")]
    PermanentPublishFailure { published: usize, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl ArgusError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo(message.into())
    }

    /// Whether redelivering the triggering message could succeed.
    ///
    /// A permanent publish failure is retryable from the consumer's point of view: the
    /// events stay in the persisted log and the redelivered message flushes them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_)
                | Self::Timeout(_)
                | Self::Database(_)
                | Self::PermanentPublishFailure { .. }
        )
    }
}

impl From<serde_json::Error> for ArgusError {
    fn from(error: serde_json::Error) -> Self {
        ArgusError::Serialization(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for ArgusError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                ArgusError::TransientIo(err.to_string())
            }
            other => ArgusError::Database(other.to_string()),
        }
    }
}

impl From<MessagingError> for ArgusError {
    fn from(error: MessagingError) -> Self {
        if error.is_retryable() {
            ArgusError::TransientIo(error.to_string())
        } else {
            ArgusError::InvalidState(error.to_string())
        }
    }
}

impl From<StoreError> for ArgusError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Serialization(msg) => ArgusError::Serialization(msg),
            other => ArgusError::TransientIo(other.to_string()),
        }
    }
}

impl From<crate::config::ConfigurationError> for ArgusError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        ArgusError::Configuration(error.to_string())
    }
}

pub type ArgusResult<T> = std::result::Result<T, ArgusError>;
