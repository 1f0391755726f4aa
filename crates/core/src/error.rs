use thiserror::Error;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Commerce API error: {0}")]
    Commerce(String),

    #[error("Persistence store error: {0}")]
    Store(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for RecoveryError {
    fn from(err: config::ConfigError) -> Self {
        RecoveryError::Config(err.to_string())
    }
}
