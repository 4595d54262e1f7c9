use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("other: {0}")]
    Other(String),
}

impl ClientError {
    /// Whether the error came from the transport (connect/timeout) rather than the device.
    pub fn is_connectivity(&self) -> bool {
        match self {
            ClientError::HttpError(e) => e.is_connect() || e.is_timeout(),
            ClientError::Timeout(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
