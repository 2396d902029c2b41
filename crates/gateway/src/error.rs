//! Gateway error types.

use group_directory::DirectoryError;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Broker error from nats_client.
    #[error("Error: {0}")]
    Anyhow(#[from] anyhow::Error),

    /// Redis error from discovery or the inbox.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Group directory error.
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Connection not registered.
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// Client frame that cannot be routed.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,

    /// Bad configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Short code sent to clients in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Json(_) | GatewayError::InvalidFrame(_) => "INVALID_MESSAGE",
            GatewayError::Directory(_) => "DIRECTORY_ERROR",
            _ => "PROCESSING_ERROR",
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(GatewayError::from(json).code(), "INVALID_MESSAGE");
        assert_eq!(GatewayError::InvalidFrame("x".into()).code(), "INVALID_MESSAGE");
        assert_eq!(
            GatewayError::from(DirectoryError::StoreUnavailable("down".into())).code(),
            "DIRECTORY_ERROR"
        );
        assert_eq!(GatewayError::ChannelSend.code(), "PROCESSING_ERROR");
        assert_eq!(
            GatewayError::Internal("publish lane closed".into()).code(),
            "PROCESSING_ERROR"
        );
        assert_eq!(
            GatewayError::from(anyhow::anyhow!("publish failed")).code(),
            "PROCESSING_ERROR"
        );
    }
}
