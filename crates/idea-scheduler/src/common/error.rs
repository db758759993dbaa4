use thiserror::Error;

use crate::common::error::IdeaError::GenericError;

#[derive(Debug, Error)]
pub enum IdeaError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid queue profile: {0}")]
    InvalidQueueProfile(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for IdeaError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for IdeaError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:#}"))
    }
}

impl From<toml::de::Error> for IdeaError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

impl From<String> for IdeaError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
