//! Broker transport abstraction.
//!
//! A [`BrokerTransport`] is one client connection to a message broker. The
//! connection multiplexer owns transports; routers only ever reach them
//! through the multiplexer, by connection key.

mod mqtt;

pub use mqtt::{MqttTransport, MqttTransportFactory};

use async_trait::async_trait;
use std::sync::Arc;

use crate::registrar::EndpointCredentials;

/// Errors from broker transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connecting to the broker failed or timed out
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The transport has no live session
    #[error("Not connected")]
    NotConnected,

    /// A publish was rejected by the client
    #[error("Publish failed: {0}")]
    Publish(String),

    /// A subscribe or unsubscribe was rejected by the client
    #[error("Subscription failed: {0}")]
    Subscribe(String),

    /// TLS material could not be used
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// One client connection to a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open the session. Calling this on a connected transport reconnects.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the session. Never fails; errors are logged.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Subscribe to topic filters. Filters are remembered and re-subscribed
    /// after a reconnect.
    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError>;

    /// Wait for the next inbound message. `None` means the transport will not
    /// produce any more messages.
    async fn receive(&self) -> Option<InboundMessage>;
}

/// Creates transports for the connection multiplexer.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        client_id: &str,
        credentials: &EndpointCredentials,
    ) -> Result<Arc<dyn BrokerTransport>, TransportError>;
}

/// Publish once; on failure reconnect and resend once. A second failure is
/// logged and the message is dropped.
pub async fn publish_with_retry(transport: &dyn BrokerTransport, topic: &str, payload: &str) -> bool {
    let first = match transport.publish(topic, payload).await {
        Ok(()) => return true,
        Err(e) => e,
    };

    tracing::warn!(topic, error = %first, "publish failed, reconnecting");
    transport.disconnect().await;
    if let Err(e) = transport.connect().await {
        tracing::error!(topic, error = %e, "reconnect failed, message dropped");
        return false;
    }

    match transport.publish(topic, payload).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(topic, error = %e, "publish failed after reconnect, message dropped");
            false
        }
    }
}
