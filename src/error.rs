//! Error handling for the image transmitter

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransmitError>;

#[derive(Debug, Error)]
pub enum TransmitError {
    /// Bad configuration, missing repos, failed preflight. Aborts the run.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unparseable or unreachable image reference. Collected, never retried.
    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Size or digest mismatch between what a manifest declares and what a
    /// stream delivered.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Blob not found in datafiles: {0}")]
    BlobNotFound(String),

    #[error("User cancelled...")]
    Cancelled,
}

impl From<std::io::Error> for TransmitError {
    fn from(err: std::io::Error) -> Self {
        TransmitError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for TransmitError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            TransmitError::Network(format!("connection failed: {}", err))
        } else if err.is_decode() {
            TransmitError::Parse(format!("response decode error: {}", err))
        } else {
            TransmitError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransmitError {
    fn from(err: serde_json::Error) -> Self {
        TransmitError::Parse(format!("JSON parsing failed: {}", err))
    }
}

impl From<serde_yaml::Error> for TransmitError {
    fn from(err: serde_yaml::Error) -> Self {
        TransmitError::Parse(format!("YAML parsing failed: {}", err))
    }
}

impl From<url::ParseError> for TransmitError {
    fn from(err: url::ParseError) -> Self {
        TransmitError::Config(format!("invalid URL format: {}", err))
    }
}
