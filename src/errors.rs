use thiserror::Error;

use crate::domain::errors::{StoreError, TransportError};

#[derive(Debug, Error)]
pub enum OutboxError {
    /// Every send attempt allowed by the retry policy failed.
    #[error("Exceeded send attempts: {attempts}")]
    ExceededSendAttempts { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No callback registered under '{0}'")]
    UnknownCallback(String),
}

impl OutboxError {
    /// Errors that should stop the process instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OutboxError::Config(_) | OutboxError::UnknownCallback(_))
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;
