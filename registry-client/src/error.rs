//! Error types for the registry client

use thiserror::Error;

/// Errors that can occur while talking to the device registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Network or HTTP transport error
    #[error("Network/HTTP error: {0}")]
    Network(String),

    /// The registry answered with a body that could not be interpreted
    #[error("Invalid registry response: {0}")]
    InvalidResponse(String),

    /// The operation does not exist for the configured webhook scheme
    #[error("Operation not supported by {0} scheme")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Network(err.to_string())
    }
}
