//! HTTP webhook receiver for device registry notifications.
//!
//! The device registry pushes notification batches (registrations,
//! de-registrations, observations, async responses) to a single callback URL.
//! This crate provides the thin HTTP layer that receives those pushes and hands
//! them, unparsed, to the bridge.
//!
//! # Overview
//!
//! - [`WebhookServer`]: binds to a port in a configured range, accepts `PUT`
//!   and `POST` deliveries on registered callback paths and always acknowledges
//!   them with `200 OK`.
//! - [`WebhookRouter`]: tracks the callback paths this process has installed
//!   and forwards deliveries for them to a channel.
//! - [`WebhookPayload`]: raw body plus the `Authentication` header, if any.
//!
//! Authentication is deliberately *not* checked here. The registry only
//! expects an acknowledgement; whether the batch is trusted is decided by the
//! consumer of the channel.
//!
//! # Example
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use webhook_server::{WebhookPayload, WebhookServer, WebhookServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), webhook_server::WebhookServerError> {
//!     let (tx, mut rx) = mpsc::unbounded_channel::<WebhookPayload>();
//!     let server = WebhookServer::new(WebhookServerConfig::default(), tx).await?;
//!     server.router().register("/notify").await;
//!
//!     tracing::info!(url = %server.callback_url("/notify"), "webhook ready");
//!     while let Some(delivery) = rx.recv().await {
//!         tracing::info!(bytes = delivery.body.len(), "batch received");
//!     }
//!     Ok(())
//! }
//! ```

mod error;
pub mod router;
mod server;

pub use error::WebhookServerError;
pub use router::{WebhookPayload, WebhookRouter};
pub use server::{WebhookServer, WebhookServerConfig};
