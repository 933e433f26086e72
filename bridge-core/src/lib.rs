//! # coap-bridge-core
//!
//! Bridges a CoAP device registry to MQTT broker backends.
//!
//! The registry pushes device lifecycle and telemetry events to a webhook;
//! this crate turns those batches into broker messages and turns broker
//! commands back into registry operations. Several backends can be served at
//! once, each through its own [`NotificationRouter`].
//!
//! # Components
//!
//! - [`SubscriptionRegistry`]: resource observations the bridge maintains
//! - [`AsyncResponseCorrelator`]: replies that complete in a later batch
//! - [`EndpointConnectionMultiplexer`]: broker connections per endpoint
//! - [`WebhookGateway`] and [`WebhookValidator`]: webhook install and repair
//! - [`NotificationRouter`]: per-backend routing in both directions
//! - [`Orchestrator`]: wires one webhook source to every router

mod api;
pub mod backend;
mod batch;
mod config;
mod correlator;
mod error;
mod gateway;
mod multiplexer;
mod orchestrator;
mod registrar;
mod router;
mod subscriptions;
pub mod transport;
mod types;
mod validator;

pub use api::RegistryApi;
pub use backend::{Backend, CommandKind, CommandReply, DeviceMqttBackend, GenericMqttBackend, ParsedCommand};
pub use batch::*;
pub use config::*;
pub use correlator::{AsyncReplySink, AsyncResponseCorrelator, PendingAsyncRequest, PendingContext};
pub use error::*;
pub use gateway::{compute_authentication_hash, WebhookGateway};
pub use multiplexer::{EndpointConnectionMultiplexer, MessageHandler};
pub use orchestrator::{Orchestrator, RouterBinding};
pub use registrar::*;
pub use router::NotificationRouter;
pub use subscriptions::SubscriptionRegistry;
pub use transport::{BrokerTransport, InboundMessage, TransportError, TransportFactory};
pub use types::*;
pub use validator::{ValidationOutcome, ValidatorHandle, WebhookValidator};
