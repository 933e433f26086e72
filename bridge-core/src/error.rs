//! Error types for the bridge core.

use registry_client::RegistryError;

use crate::registrar::RegistrarError;
use crate::transport::TransportError;

/// Errors surfaced by the orchestrator and its components.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The device registry could not be reached or answered garbage
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A broker connection failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The backend's device registrar failed
    #[error("Registrar error: {0}")]
    Registrar(#[from] RegistrarError),

    /// An error occurred during shutdown
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// Configuration problems found by `validate()`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is missing
    #[error("Missing setting: {0}")]
    Missing(&'static str),

    /// A setting has an unusable value
    #[error("Invalid setting {field}: {reason}")]
    Invalid {
        /// Dotted name of the setting
        field: String,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for Results using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
