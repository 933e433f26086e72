//! MQTT transport on rumqttc.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{BrokerTransport, InboundMessage, TransportError, TransportFactory};
use crate::config::MqttConfig;
use crate::registrar::EndpointCredentials;

/// rumqttc rejects keep-alive intervals below this.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Grace period for the event loop to flush a DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Consecutive event loop errors tolerated before the session is given up.
const MAX_POLL_ERRORS: u32 = 3;

/// Pause after a failed poll, multiplied by the number of consecutive errors.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

struct Session {
    client: AsyncClient,
    poller: JoinHandle<()>,
}

/// One MQTT client session.
///
/// A background task drives the rumqttc event loop and forwards PUBLISH
/// packets to [`BrokerTransport::receive`]. When the broker drops the session
/// the task keeps polling, which makes rumqttc reconnect, and re-subscribes
/// every topic filter this transport has seen once the broker accepts the new
/// session. After [`MAX_POLL_ERRORS`] failures in a row the task gives up and
/// the transport reports disconnected until [`BrokerTransport::connect`] is
/// called again.
pub struct MqttTransport {
    client_id: String,
    options: MqttOptions,
    capacity: usize,
    connect_timeout: Duration,
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
    topics: Arc<Mutex<Vec<String>>>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl MqttTransport {
    pub fn new(options: MqttOptions, capacity: usize, connect_timeout: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            client_id: options.client_id(),
            options,
            capacity,
            connect_timeout,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            topics: Arc::new(Mutex::new(Vec::new())),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn client(&self) -> Result<AsyncClient, TransportError> {
        match self.session.lock().await.as_ref() {
            Some(session) if self.is_connected() => Ok(session.client.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.disconnect().await;

        let (client, eventloop) = AsyncClient::new(self.options.clone(), self.capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let poller = tokio::spawn(poll_events(
            eventloop,
            SessionLink {
                client_id: self.client_id.clone(),
                client: client.clone(),
                connected: self.connected.clone(),
                topics: self.topics.clone(),
                inbound: self.inbound_tx.clone(),
            },
            ready_tx,
        ));

        let outcome = match timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::Connect(reason)),
            Ok(Err(_)) => Err(TransportError::Connect("event loop stopped".to_string())),
            Err(_) => Err(TransportError::Connect(format!(
                "no CONNACK within {:?}",
                self.connect_timeout
            ))),
        };
        if let Err(e) = outcome {
            poller.abort();
            return Err(e);
        }

        let topics = self.topics.lock().await.clone();
        for topic in &topics {
            if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                poller.abort();
                self.connected.store(false, Ordering::SeqCst);
                return Err(TransportError::Subscribe(e.to_string()));
            }
        }

        let replaced = self.session.lock().await.replace(Session { client, poller });
        if let Some(stale) = replaced {
            stale.poller.abort();
        }
        tracing::info!(
            client_id = %self.client_id,
            resubscribed = topics.len(),
            "broker session established"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut session) = session {
            if let Err(e) = session.client.disconnect().await {
                tracing::debug!(client_id = %self.client_id, error = %e, "disconnect request not sent");
            }
            if timeout(DISCONNECT_GRACE, &mut session.poller).await.is_err() {
                session.poller.abort();
            }
            tracing::debug!(client_id = %self.client_id, "broker session closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        {
            let mut known = self.topics.lock().await;
            for topic in topics {
                if !known.contains(topic) {
                    known.push(topic.clone());
                }
            }
        }

        let client = self.client().await?;
        for topic in topics {
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
            tracing::debug!(client_id = %self.client_id, topic, "subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.topics.lock().await.retain(|t| !topics.contains(t));

        let client = self.client().await?;
        for topic in topics {
            client
                .unsubscribe(topic.as_str())
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        let client = self.client().await?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn receive(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }
}

/// What the event loop task shares with its transport.
struct SessionLink {
    client_id: String,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topics: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

impl SessionLink {
    /// Queue a subscribe for every known filter on a session the event loop
    /// re-established by itself. The requests are queued without waiting so
    /// the event loop is never blocked on its own request channel.
    async fn resubscribe(&self) {
        let topics = self.topics.lock().await.clone();
        for topic in &topics {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                tracing::warn!(client_id = %self.client_id, topic, error = %e, "re-subscribe not queued");
            }
        }
        tracing::info!(client_id = %self.client_id, resubscribed = topics.len(), "broker session re-established");
    }
}

/// Drive the event loop until the session is closed or lost for good.
async fn poll_events(
    mut eventloop: EventLoop,
    link: SessionLink,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    let mut errors = 0u32;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                errors = 0;
                link.connected.store(true, Ordering::SeqCst);
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => link.resubscribe().await,
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                };
                if link.inbound.send(message).is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                link.connected.store(false, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }

                errors += 1;
                if errors >= MAX_POLL_ERRORS {
                    tracing::error!(client_id = %link.client_id, error = %e, errors, "broker session lost, giving up");
                    break;
                }
                tracing::warn!(client_id = %link.client_id, error = %e, errors, "broker session lost, retrying");
                tokio::time::sleep(POLL_ERROR_BACKOFF * errors).await;
            }
        }
    }

    link.connected.store(false, Ordering::SeqCst);
}

/// Builds [`MqttTransport`]s from one router's broker settings.
pub struct MqttTransportFactory {
    config: MqttConfig,
}

impl MqttTransportFactory {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    fn options(
        &self,
        client_id: &str,
        credentials: &EndpointCredentials,
    ) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive().max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        options.set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size);

        if let Some(username) = &credentials.username {
            options.set_credentials(
                username.as_str(),
                credentials.password.as_deref().unwrap_or_default(),
            );
        }

        if let Some(ca) = &credentials.ca_pem {
            let client_auth = match (&credentials.client_cert_pem, &credentials.client_key_pem) {
                (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
                (None, None) => None,
                _ => {
                    return Err(TransportError::Tls(
                        "client certificate and key must be given together".to_string(),
                    ))
                }
            };
            options.set_transport(Transport::tls(ca.clone(), client_auth, None));
        }

        Ok(options)
    }
}

impl TransportFactory for MqttTransportFactory {
    fn create(
        &self,
        client_id: &str,
        credentials: &EndpointCredentials,
    ) -> Result<Arc<dyn BrokerTransport>, TransportError> {
        let options = self.options(client_id, credentials)?;
        Ok(Arc::new(MqttTransport::new(
            options,
            self.config.channel_capacity,
            self.config.connect_timeout(),
        )))
    }
}
