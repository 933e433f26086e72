//! Routing between webhook batches and one broker backend.
//!
//! A [`NotificationRouter`] sits between the registry-facing [`RegistryApi`]
//! and the broker connections of a single backend:
//!
//! - telemetry notifications are decoded, formatted and published;
//! - registrations subscribe observable resources, register the device with
//!   the backend and open its command connection;
//! - deregistrations undo all of that;
//! - broker commands become registry operations whose results are published
//!   back, either immediately or once the async response arrives.

use async_trait::async_trait;
use registry_client::{CoapVerb, RegistryResponse};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};

use crate::api::RegistryApi;
use crate::backend::{Backend, CommandKind, CommandReply, ParsedCommand};
use crate::batch::{decode_coap_payload, AsyncResponse, Notification, NotificationBatch, Registration};
use crate::config::RouterConfig;
use crate::correlator::{AsyncReplySink, PendingAsyncRequest, PendingContext};
use crate::multiplexer::{EndpointConnectionMultiplexer, MessageHandler};
use crate::registrar::DeviceRegistrar;
use crate::transport::{InboundMessage, TransportFactory};
use crate::types::{ConnectionMode, EndpointMetadata};

pub struct NotificationRouter {
    backend: Arc<dyn Backend>,
    registrar: Arc<dyn DeviceRegistrar>,
    multiplexer: EndpointConnectionMultiplexer,
    api: Arc<RegistryApi>,
    auto_subscribe: bool,
    default_device_type: String,
    /// Endpoint types learned from registrations
    endpoint_types: RwLock<HashMap<String, String>>,
    /// Serializes registration handling
    registration_lock: Mutex<()>,
    self_ref: Weak<NotificationRouter>,
}

impl NotificationRouter {
    pub fn new(
        config: &RouterConfig,
        backend: Arc<dyn Backend>,
        registrar: Arc<dyn DeviceRegistrar>,
        factory: Arc<dyn TransportFactory>,
        api: Arc<RegistryApi>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            multiplexer: EndpointConnectionMultiplexer::new(
                factory,
                registrar.clone(),
                config.receive_loop_interval(),
            ),
            backend,
            registrar,
            api,
            auto_subscribe: config.auto_subscribe,
            default_device_type: config.default_device_type.clone(),
            endpoint_types: RwLock::new(HashMap::new()),
            registration_lock: Mutex::new(()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn multiplexer(&self) -> &EndpointConnectionMultiplexer {
        &self.multiplexer
    }

    fn handler(&self) -> Weak<dyn MessageHandler> {
        self.self_ref.clone()
    }

    /// Known type of an endpoint, else the configured default.
    pub async fn endpoint_type(&self, endpoint: &str) -> String {
        self.endpoint_types
            .read()
            .await
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| self.default_device_type.clone())
    }

    /// Open the shared connection for backends that use one. Per-endpoint
    /// backends connect as endpoints register.
    pub async fn start(&self) -> bool {
        if self.backend.connection_mode() != ConnectionMode::Shared {
            return true;
        }
        let key = self.backend.connection_key("");
        let topics = self.backend.command_topics("", &self.default_device_type);
        let connected = self
            .multiplexer
            .subscribe_topics(&key, "", self.handler(), &topics)
            .await;
        if connected {
            tracing::info!(router = self.name(), ?topics, "router listening for commands");
        }
        connected
    }

    pub async fn shutdown(&self) {
        self.multiplexer.disconnect_all().await;
        tracing::info!(router = self.name(), "router stopped");
    }

    /// Handle everything in a batch except async responses, which are
    /// resolved once for all routers.
    pub async fn process_batch(&self, batch: &NotificationBatch) {
        if !batch.notifications.is_empty() {
            self.process_notifications(&batch.notifications).await;
        }

        let registrations: Vec<&Registration> = batch.all_registrations().collect();
        if !registrations.is_empty() {
            let _guard = self.registration_lock.lock().await;
            for registration in registrations {
                self.register_endpoint(registration).await;
            }
        }

        let departed: Vec<String> = batch.all_deregistrations().cloned().collect();
        if !departed.is_empty() {
            self.process_deregistrations(&departed).await;
        }
    }

    /// Publish telemetry notifications. Returns how many were published.
    pub async fn process_notifications(&self, notifications: &[Notification]) -> usize {
        let mut published = 0;
        for notification in notifications {
            if self.publish_notification(notification).await {
                published += 1;
            }
        }
        published
    }

    async fn publish_notification(&self, notification: &Notification) -> bool {
        let endpoint = &notification.ep;
        let endpoint_type = self.endpoint_type(endpoint).await;
        let decoded = decode_coap_payload(&notification.payload);

        let Some(payload) =
            self.backend
                .format_observation(notification, &endpoint_type, decoded.as_deref())
        else {
            return false;
        };
        let topic = self.backend.observation_topic(endpoint, &endpoint_type);
        let key = self.backend.connection_key(endpoint);

        if !self
            .multiplexer
            .ensure_connected(&key, endpoint, self.handler())
            .await
        {
            return false;
        }
        tracing::debug!(router = self.name(), endpoint = %endpoint, topic = %topic, "publishing observation");
        self.multiplexer.publish(&key, &topic, &payload).await
    }

    pub async fn process_registrations(&self, registrations: &[Registration]) {
        let _guard = self.registration_lock.lock().await;
        for registration in registrations {
            self.register_endpoint(registration).await;
        }
    }

    /// Callers hold the registration lock.
    async fn register_endpoint(&self, registration: &Registration) {
        let endpoint = registration.ep.as_str();
        let domain = self.api.default_domain().to_string();
        let endpoint_type = registration
            .ept
            .clone()
            .filter(|ept| !ept.trim().is_empty())
            .unwrap_or_else(|| self.default_device_type.clone());
        self.endpoint_types
            .write()
            .await
            .insert(endpoint.to_string(), endpoint_type.clone());

        let subscriptions = self.api.subscriptions();
        for resource in &registration.resources {
            let path = resource.path.as_str();
            if subscriptions.contains(None, endpoint, path).await {
                self.api.subscribe(None, endpoint, path).await;
                subscriptions.remove(None, endpoint, path).await;
                subscriptions.add(None, endpoint, path).await;
            } else if resource.obs && self.auto_subscribe {
                // Tracked even if the call fails; the validator replays it.
                self.api.subscribe(None, endpoint, path).await;
                subscriptions.add(None, endpoint, path).await;
            }
        }

        let metadata = EndpointMetadata {
            name: endpoint.to_string(),
            endpoint_type: endpoint_type.clone(),
            domain: domain.clone(),
            resources: registration.resources.clone(),
            details: self.api.endpoint_details(None, endpoint).await,
        };
        match self.registrar.register_new_device(&metadata).await {
            Ok(new) => tracing::info!(router = self.name(), endpoint, new, "device registered"),
            Err(e) => tracing::error!(router = self.name(), endpoint, error = %e, "device registration failed"),
        }

        let key = self.backend.connection_key(endpoint);
        let topics = self.backend.command_topics(endpoint, &endpoint_type);
        if !self
            .multiplexer
            .subscribe_topics(&key, endpoint, self.handler(), &topics)
            .await
        {
            tracing::error!(router = self.name(), endpoint, "command topics not subscribed");
            return;
        }

        if let Some((topic, payload)) = self.backend.registration_announcement(registration, &domain) {
            self.multiplexer.publish(&key, &topic, &payload).await;
        }
    }

    /// Tear down everything a registration set up for each endpoint.
    pub async fn process_deregistrations(&self, endpoints: &[String]) {
        for endpoint in endpoints {
            let endpoint_type = self.endpoint_type(endpoint).await;
            let key = self.backend.connection_key(endpoint);
            let per_endpoint = self.backend.connection_mode() == ConnectionMode::PerEndpoint;

            // A shared connection keeps serving every other endpoint.
            if per_endpoint {
                let topics = self.backend.command_topics(endpoint, &endpoint_type);
                self.multiplexer.unsubscribe_topics(&key, &topics).await;
            }

            let removed = self.api.subscriptions().remove_all(endpoint).await;
            let abandoned = self.api.correlator().remove_for_endpoint(endpoint).await;
            if abandoned > 0 {
                tracing::debug!(router = self.name(), endpoint = %endpoint, abandoned, "pending async requests dropped");
            }

            match self.registrar.deregister_device(endpoint).await {
                Ok(existed) => tracing::info!(router = self.name(), endpoint = %endpoint, existed, removed, "device deregistered"),
                Err(e) => tracing::error!(router = self.name(), endpoint = %endpoint, error = %e, "device deregistration failed"),
            }

            if per_endpoint {
                self.multiplexer.disconnect(&key).await;
            }
            self.endpoint_types.write().await.remove(endpoint.as_str());
        }
    }

    /// Execute a broker command against the registry and publish its result.
    pub async fn handle_command(&self, connection_key: &str, message: &InboundMessage) {
        let endpoint_type = match self.backend.connection_mode() {
            ConnectionMode::PerEndpoint => self.endpoint_type(connection_key).await,
            ConnectionMode::Shared => self.default_device_type.clone(),
        };
        let Some(command) = self
            .backend
            .parse_command(connection_key, &endpoint_type, message)
        else {
            tracing::debug!(router = self.name(), topic = %message.topic, "message is not a command");
            return;
        };
        tracing::debug!(router = self.name(), kind = ?command.kind, topic = %message.topic, "command received");

        let domain = command.domain.as_deref();
        let response = match command.kind {
            CommandKind::EndpointDiscovery => {
                self.api
                    .discover_devices(domain, command.endpoint_type.as_deref())
                    .await
            }
            CommandKind::ResourceDiscovery => {
                let Some(endpoint) = command.endpoint.as_deref() else {
                    return;
                };
                self.api.discover_resources(domain, endpoint).await
            }
            CommandKind::SubscriptionManagement => self.manage_subscription(&command).await,
            CommandKind::ResourceRequest => {
                let (Some(endpoint), Some(path)) =
                    (command.endpoint.as_deref(), command.resource_path.as_deref())
                else {
                    tracing::warn!(topic = %message.topic, "resource request without endpoint or path");
                    return;
                };
                let response = self
                    .api
                    .dispatch(domain, command.verb, endpoint, path, command.value.as_deref())
                    .await;
                match response {
                    Some(response) if response.has_async_marker() => {
                        self.defer_reply(connection_key, &command, &response).await;
                        return;
                    }
                    other => other,
                }
            }
        };

        let Some(response) = response else {
            return;
        };
        self.reply(connection_key, &command, &response).await;
    }

    async fn manage_subscription(&self, command: &ParsedCommand) -> Option<RegistryResponse> {
        let (Some(endpoint), Some(path)) =
            (command.endpoint.as_deref(), command.resource_path.as_deref())
        else {
            return None;
        };
        let domain = command.domain.as_deref();
        let subscriptions = self.api.subscriptions();

        if command.unsubscribe {
            subscriptions.remove(domain, endpoint, path).await;
            self.api.unsubscribe(domain, endpoint, path).await
        } else {
            subscriptions.add(domain, endpoint, path).await;
            self.api.subscribe(domain, endpoint, path).await
        }
    }

    /// Only GETs produce a deferred reply; other verbs' markers are dropped.
    async fn defer_reply(&self, connection_key: &str, command: &ParsedCommand, response: &RegistryResponse) {
        if command.verb != CoapVerb::Get {
            tracing::debug!(verb = %command.verb, "async marker on non-GET request discarded");
            return;
        }
        let context = PendingContext {
            connection_key: connection_key.to_string(),
            verb: command.verb,
            endpoint: command.endpoint.clone().unwrap_or_default(),
            resource_path: command.resource_path.clone().unwrap_or_default(),
            response_topic: command.response_topic.clone(),
            reply_topic: command.reply_topic.clone(),
            raw_request: command.raw_payload.clone(),
        };
        let sink: Weak<dyn AsyncReplySink> = self.self_ref.clone();
        self.api
            .correlator()
            .record_pending(response, context, sink)
            .await;
    }

    async fn reply(&self, connection_key: &str, command: &ParsedCommand, response: &RegistryResponse) {
        let reply = CommandReply {
            verb: command.verb,
            endpoint: command.endpoint.clone(),
            resource_path: command.resource_path.clone(),
            value: (!response.body.is_empty()).then(|| response.body.clone()),
            status: Some(response.status),
        };
        let Some(payload) = self.backend.format_reply(&reply) else {
            return;
        };
        self.multiplexer
            .publish(connection_key, &command.response_topic, &payload)
            .await;
    }
}

#[async_trait]
impl MessageHandler for NotificationRouter {
    async fn handle_message(&self, connection_key: &str, message: InboundMessage) {
        self.handle_command(connection_key, &message).await;
    }
}

#[async_trait]
impl AsyncReplySink for NotificationRouter {
    /// Published over the connection currently serving the request's key.
    /// Once that connection is gone the reply is dropped rather than
    /// reconnecting for it.
    async fn deliver_async_reply(
        &self,
        request: &PendingAsyncRequest,
        value: Option<&str>,
        event: &AsyncResponse,
    ) -> bool {
        if let Some(error) = &event.error {
            tracing::warn!(async_id = %request.async_id, error = %error, "async request failed on the device");
        }
        let Some(payload) = self.backend.format_reply(&CommandReply {
            verb: request.verb,
            endpoint: Some(request.endpoint.clone()),
            resource_path: Some(request.resource_path.clone()),
            value: value.map(str::to_string),
            status: event.status,
        }) else {
            return false;
        };
        self.multiplexer
            .publish(&request.connection_key, request.delivery_topic(), &payload)
            .await
    }
}
