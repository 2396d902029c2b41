//! Error types for the group directory.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Group already exists: {0}")]
    GroupExists(String),

    /// The durable store could not be reached or answered with garbage.
    #[error("Group store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid group: {0}")]
    InvalidGroup(String),
}

impl DirectoryError {
    /// Whether the error means the group simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::GroupNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, DirectoryError>;
