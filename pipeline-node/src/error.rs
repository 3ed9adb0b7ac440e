use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Malformed configuration field; isolated to the offending item.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Download, extraction, bundle layout or missing-file failure.
    #[error("Provisioning error: {0}")]
    ProvisioningError(String),

    /// Stream, sensor or pipeline cross-reference missing.
    #[error("Linkage error: {0}")]
    LinkageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Messaging error: {0}")]
    MessagingError(String),

    #[error("Launch error: {0}")]
    LaunchError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<zmq::Error> for NodeError {
    fn from(error: zmq::Error) -> Self {
        NodeError::MessagingError(error.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(error: serde_json::Error) -> Self {
        NodeError::SerializationError(error.to_string())
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(error: reqwest::Error) -> Self {
        NodeError::ProvisioningError(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NodeError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        NodeError::Timeout(error.to_string())
    }
}

impl From<config::ConfigError> for NodeError {
    fn from(error: config::ConfigError) -> Self {
        NodeError::ConfigError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
