//! Error types for the webhook server

use thiserror::Error;

/// Errors raised while starting or stopping the webhook server
#[derive(Debug, Error)]
pub enum WebhookServerError {
    /// No port in the configured range could be bound
    #[error("No available port found in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    /// The advertised base URL could not be parsed
    #[error("Invalid advertised URL '{0}'")]
    InvalidAdvertisedUrl(String),

    /// The local address used in callback URLs could not be detected
    #[error("Failed to detect local IP address")]
    LocalAddressUnavailable,

    /// The HTTP server task exited before signalling readiness
    #[error("Server failed to start")]
    StartupFailed,

    /// The HTTP server task panicked during shutdown
    #[error("Server shutdown failed: {0}")]
    ShutdownFailed(String),
}
