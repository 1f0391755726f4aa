use recovery_core::RecoveryError;
use thiserror::Error;

pub type IntegrationResult<T> = Result<T, IntegrationError>;

#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IntegrationError {
    /// Attribute a failure to the persistence store rather than the commerce API.
    pub fn into_store_error(self) -> RecoveryError {
        match self {
            IntegrationError::Conflict(msg) => RecoveryError::Duplicate(msg),
            IntegrationError::Config(msg) => RecoveryError::Config(msg),
            other => RecoveryError::Store(other.to_string()),
        }
    }
}

impl From<IntegrationError> for RecoveryError {
    fn from(err: IntegrationError) -> Self {
        match err {
            IntegrationError::Conflict(msg) => RecoveryError::Duplicate(msg),
            IntegrationError::Config(msg) => RecoveryError::Config(msg),
            other => RecoveryError::Commerce(other.to_string()),
        }
    }
}
