//! Mock registry client, transports and registrar for bridge tests.
//!
//! The mocks record every call so tests can assert on what the bridge did,
//! and expose switches to simulate registry and broker failures.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_core::{
    BrokerTransport, DeviceRegistrar, EndpointCredentials, EndpointMetadata, InboundMessage,
    RegistrarError, TransportError, TransportFactory,
};
use registry_client::{CoapVerb, DeviceRegistryClient, RegistryError, RegistryResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Registry client that answers from configurable state.
///
/// Every call is appended to `calls` as `"<operation> <args...>"`.
#[derive(Default)]
pub struct MockRegistryClient {
    pub calls: Mutex<Vec<String>>,
    /// Webhook URL the "registry" currently holds
    pub callback_url: Mutex<Option<String>>,
    /// When set, `install_callback` answers 200 without changing anything
    pub install_ignored: AtomicBool,
    /// Statuses returned by successive `subscribe` calls; 200 once drained
    pub subscribe_statuses: Mutex<VecDeque<u16>>,
    /// Status of `check_subscription`
    pub check_status: Mutex<Option<u16>>,
    /// Response of `dispatch_operation`
    pub dispatch_response: Mutex<Option<RegistryResponse>>,
    /// Body of `discover_devices`
    pub devices_body: Mutex<Option<String>>,
    /// Body of `discover_resources`
    pub resources_body: Mutex<Option<String>>,
    /// Fail every call with a network error
    pub offline: AtomicBool,
}

impl MockRegistryClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_callback(url: &str) -> Arc<Self> {
        let client = Self::default();
        *client.callback_url.lock().unwrap() = Some(url.to_string());
        Arc::new(client)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose operation name is `operation`.
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn queue_subscribe_statuses(&self, statuses: &[u16]) {
        self.subscribe_statuses
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    pub fn set_dispatch_response(&self, status: u16, body: &str) {
        *self.dispatch_response.lock().unwrap() = Some(RegistryResponse::new(status, body));
    }

    pub fn set_check_status(&self, status: u16) {
        *self.check_status.lock().unwrap() = Some(status);
    }

    fn record(&self, call: String) -> Result<(), RegistryError> {
        self.calls.lock().unwrap().push(call);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RegistryError::Network("registry offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistryClient for MockRegistryClient {
    async fn subscribe(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError> {
        self.record(format!("subscribe {domain} {endpoint} {uri}"))?;
        let status = self.subscribe_statuses.lock().unwrap().pop_front().unwrap_or(200);
        Ok(RegistryResponse::new(status, ""))
    }

    async fn unsubscribe(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError> {
        self.record(format!("unsubscribe {domain} {endpoint} {uri}"))?;
        Ok(RegistryResponse::new(204, ""))
    }

    async fn check_subscription(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError> {
        self.record(format!("check_subscription {domain} {endpoint} {uri}"))?;
        let status = self.check_status.lock().unwrap().unwrap_or(200);
        Ok(RegistryResponse::new(status, ""))
    }

    async fn discover_devices(
        &self,
        domain: &str,
        endpoint_type: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError> {
        self.record(format!(
            "discover_devices {domain} {}",
            endpoint_type.unwrap_or("*")
        ))?;
        let body = self
            .devices_body
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "[]".to_string());
        Ok(RegistryResponse::new(200, body))
    }

    async fn discover_resources(
        &self,
        domain: &str,
        endpoint: &str,
    ) -> Result<RegistryResponse, RegistryError> {
        self.record(format!("discover_resources {domain} {endpoint}"))?;
        match self.resources_body.lock().unwrap().clone() {
            Some(body) => Ok(RegistryResponse::new(200, body)),
            None => Ok(RegistryResponse::new(404, "")),
        }
    }

    async fn dispatch_operation(
        &self,
        domain: &str,
        verb: CoapVerb,
        endpoint: &str,
        uri: &str,
        value: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError> {
        self.record(format!(
            "dispatch_operation {domain} {verb} {endpoint} {uri} {}",
            value.unwrap_or("-")
        ))?;
        Ok(self
            .dispatch_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| RegistryResponse::new(200, "")))
    }

    async fn install_callback(
        &self,
        url: &str,
        authentication: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError> {
        self.record(format!(
            "install_callback {url} {}",
            authentication.unwrap_or("-")
        ))?;
        if !self.install_ignored.load(Ordering::SeqCst) {
            *self.callback_url.lock().unwrap() = Some(url.to_string());
        }
        Ok(RegistryResponse::new(200, ""))
    }

    async fn reset_callback(&self) -> Result<RegistryResponse, RegistryError> {
        self.record("reset_callback".to_string())?;
        *self.callback_url.lock().unwrap() = None;
        Ok(RegistryResponse::new(204, ""))
    }

    async fn get_callback(&self) -> Result<Option<String>, RegistryError> {
        self.record("get_callback".to_string())?;
        Ok(self.callback_url.lock().unwrap().clone())
    }
}

/// Broker transport that records traffic and replays injected messages.
pub struct MockTransport {
    pub client_id: String,
    pub connected: AtomicBool,
    pub connect_count: AtomicU32,
    pub disconnect_count: AtomicU32,
    /// Number of upcoming publishes that fail
    pub failing_publishes: AtomicU32,
    pub published: Mutex<Vec<(String, String)>>,
    pub subscribed: Mutex<Vec<String>>,
    pub unsubscribed: Mutex<Vec<String>>,
    /// How long each connect takes
    pub connect_delay: Option<Duration>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl MockTransport {
    pub fn new(client_id: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            client_id: client_id.to_string(),
            connected: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            failing_publishes: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            connect_delay: None,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    /// Deliver a message as if the broker had sent it.
    pub fn inject(&self, topic: &str, payload: &str) {
        let _ = self.inbound_tx.send(InboundMessage::new(topic, payload));
    }

    /// Lose the session as if the broker had dropped it.
    pub fn drop_session(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.subscribed.lock().unwrap().extend(topics.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.unsubscribed.lock().unwrap().extend(topics.iter().cloned());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        let remaining = self.failing_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_publishes.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Publish("simulated failure".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn receive(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }
}

/// Factory handing out [`MockTransport`]s and remembering them.
#[derive(Default)]
pub struct MockTransportFactory {
    pub created: Mutex<Vec<Arc<MockTransport>>>,
    pub fail_creation: AtomicBool,
    /// Transports are created but refuse to connect
    pub refuse_connect: AtomicBool,
    /// Connect delay per client id
    pub connect_delays: Mutex<HashMap<String, Duration>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make transports for `client_id` take `delay` to connect.
    pub fn delay_connect(&self, client_id: &str, delay: Duration) {
        self.connect_delays
            .lock()
            .unwrap()
            .insert(client_id.to_string(), delay);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recent transport created for `client_id`.
    pub fn transport(&self, client_id: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.client_id == client_id)
            .cloned()
    }

    /// Most recently created transport.
    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().unwrap().last().cloned()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        client_id: &str,
        _credentials: &EndpointCredentials,
    ) -> Result<Arc<dyn BrokerTransport>, TransportError> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("creation refused".to_string()));
        }
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Ok(Arc::new(RefusingTransport));
        }
        let mut transport = MockTransport::new(client_id);
        transport.connect_delay = self.connect_delays.lock().unwrap().get(client_id).copied();
        let transport = Arc::new(transport);
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Transport whose connect always fails.
pub struct RefusingTransport;

#[async_trait]
impl BrokerTransport for RefusingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Err(TransportError::Connect("connection refused".to_string()))
    }
    async fn disconnect(&self) {}
    fn is_connected(&self) -> bool {
        false
    }
    async fn subscribe(&self, _topics: &[String]) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }
    async fn unsubscribe(&self, _topics: &[String]) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }
    async fn publish(&self, _topic: &str, _payload: &str) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }
    async fn receive(&self) -> Option<InboundMessage> {
        None
    }
}

/// Registrar recording registrations and deregistrations.
#[derive(Default)]
pub struct MockRegistrar {
    pub registered: Mutex<Vec<EndpointMetadata>>,
    pub deregistered: Mutex<Vec<String>>,
    pub fail_registration: AtomicBool,
}

impl MockRegistrar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.registered
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn deregistration_count(&self, endpoint: &str) -> usize {
        self.deregistered
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == endpoint)
            .count()
    }
}

#[async_trait]
impl DeviceRegistrar for MockRegistrar {
    async fn register_new_device(&self, metadata: &EndpointMetadata) -> Result<bool, RegistrarError> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(RegistrarError::Provisioning("backend refused".to_string()));
        }
        self.registered.lock().unwrap().push(metadata.clone());
        Ok(true)
    }

    async fn deregister_device(&self, endpoint: &str) -> Result<bool, RegistrarError> {
        self.deregistered.lock().unwrap().push(endpoint.to_string());
        Ok(true)
    }

    async fn get_endpoint_credentials(
        &self,
        endpoint: &str,
    ) -> Result<EndpointCredentials, RegistrarError> {
        Ok(EndpointCredentials {
            client_id: (!endpoint.is_empty()).then(|| endpoint.to_string()),
            ..Default::default()
        })
    }
}

/// Poll `check` until it holds or a second has passed.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
