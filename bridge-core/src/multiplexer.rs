//! Broker connections keyed by endpoint.
//!
//! The multiplexer owns every live [`BrokerTransport`] of one router. Each
//! connection gets a dedicated receive task that hands inbound messages to the
//! router and is stopped through its own shutdown channel. The same task
//! notices a session the broker dropped and reconnects it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use crate::registrar::DeviceRegistrar;
use crate::transport::{publish_with_retry, BrokerTransport, InboundMessage, TransportFactory};

/// How long `disconnect` waits for a receive task to wind down.
const RECEIVE_TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a receive task checks that its session is still up.
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Receives every message arriving on a multiplexed connection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, connection_key: &str, message: InboundMessage);
}

struct EndpointConnection {
    transport: Arc<dyn BrokerTransport>,
    shutdown_tx: mpsc::Sender<()>,
    receive_task: JoinHandle<()>,
}

/// Zero or more broker connections, at most one per key.
pub struct EndpointConnectionMultiplexer {
    factory: Arc<dyn TransportFactory>,
    registrar: Arc<dyn DeviceRegistrar>,
    receive_interval: Duration,
    connections: RwLock<HashMap<String, EndpointConnection>>,
    /// One lock per key being connected, so a key is never connected twice
    /// while a slow broker only delays its own key.
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EndpointConnectionMultiplexer {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        registrar: Arc<dyn DeviceRegistrar>,
        receive_interval: Duration,
    ) -> Self {
        Self {
            factory,
            registrar,
            receive_interval,
            connections: RwLock::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure a connection exists for `key`.
    ///
    /// A new connection uses the registrar's credentials for `endpoint`. On
    /// success its receive task starts delivering to `handler`; on failure
    /// the error is logged, no entry is left behind and `false` is returned.
    pub async fn ensure_connected(
        &self,
        key: &str,
        endpoint: &str,
        handler: Weak<dyn MessageHandler>,
    ) -> bool {
        if self.connections.read().await.contains_key(key) {
            return true;
        }

        let lock = self
            .connect_locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone();
        let connected = {
            let _guard = lock.lock().await;
            self.connect_locked(key, endpoint, handler).await
        };

        let mut locks = self.connect_locks.lock().await;
        // Only the map and this call hold the lock: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        connected
    }

    /// Callers hold the key's connect lock.
    async fn connect_locked(
        &self,
        key: &str,
        endpoint: &str,
        handler: Weak<dyn MessageHandler>,
    ) -> bool {
        if self.connections.read().await.contains_key(key) {
            return true;
        }

        let credentials = match self.registrar.get_endpoint_credentials(endpoint).await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::error!(key, endpoint, error = %e, "no broker credentials");
                return false;
            }
        };

        let client_id = credentials
            .client_id
            .clone()
            .unwrap_or_else(|| default_client_id(key, endpoint));

        let transport = match self.factory.create(&client_id, &credentials) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(key, error = %e, "broker transport could not be created");
                return false;
            }
        };

        if let Err(e) = transport.connect().await {
            tracing::error!(key, client_id = %client_id, error = %e, "broker connection failed");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let receive_task = tokio::spawn(receive_loop(
            key.to_string(),
            transport.clone(),
            handler,
            self.receive_interval,
            shutdown_rx,
        ));

        self.connections.write().await.insert(
            key.to_string(),
            EndpointConnection {
                transport,
                shutdown_tx,
                receive_task,
            },
        );
        tracing::info!(key, client_id = %client_id, "broker connection opened");
        true
    }

    /// Stop the receive task, close the transport and forget the key.
    /// Returns whether a connection existed.
    pub async fn disconnect(&self, key: &str) -> bool {
        let Some(connection) = self.connections.write().await.remove(key) else {
            return false;
        };
        Self::close(key, connection).await;
        true
    }

    /// Disconnect every connection.
    pub async fn disconnect_all(&self) {
        let connections: Vec<(String, EndpointConnection)> =
            self.connections.write().await.drain().collect();
        for (key, connection) in connections {
            Self::close(&key, connection).await;
        }
    }

    /// The receive task is stopped before the transport is closed so it
    /// cannot mistake the close for a lost session and reconnect.
    async fn close(key: &str, mut connection: EndpointConnection) {
        let _ = connection.shutdown_tx.send(()).await;

        match timeout(RECEIVE_TASK_STOP_TIMEOUT, &mut connection.receive_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(key, error = %e, "receive task ended abnormally"),
            Err(_) => {
                tracing::warn!(key, "receive task did not stop, aborting");
                connection.receive_task.abort();
            }
        }

        connection.transport.disconnect().await;
        tracing::info!(key, "broker connection closed");
    }

    /// Connect if needed, then subscribe `topics`.
    pub async fn subscribe_topics(
        &self,
        key: &str,
        endpoint: &str,
        handler: Weak<dyn MessageHandler>,
        topics: &[String],
    ) -> bool {
        if !self.ensure_connected(key, endpoint, handler).await {
            return false;
        }
        let Some(transport) = self.transport(key).await else {
            return false;
        };

        match transport.subscribe(topics).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(key, ?topics, error = %e, "command topic subscription failed");
                false
            }
        }
    }

    /// Unsubscribe `topics` on an existing connection.
    pub async fn unsubscribe_topics(&self, key: &str, topics: &[String]) -> bool {
        let Some(transport) = self.transport(key).await else {
            return false;
        };

        match transport.unsubscribe(topics).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, ?topics, error = %e, "command topic unsubscribe failed");
                false
            }
        }
    }

    /// Publish over the connection for `key`, with one reconnect-and-resend
    /// attempt on failure.
    pub async fn publish(&self, key: &str, topic: &str, payload: &str) -> bool {
        let Some(transport) = self.transport(key).await else {
            tracing::warn!(key, topic, "no broker connection, message dropped");
            return false;
        };
        publish_with_retry(transport.as_ref(), topic, payload).await
    }

    pub async fn transport(&self, key: &str) -> Option<Arc<dyn BrokerTransport>> {
        self.connections
            .read()
            .await
            .get(key)
            .map(|c| c.transport.clone())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.connections.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }
}

/// Client id when the registrar supplies none: the endpoint name for
/// per-endpoint connections, a unique id for shared ones.
fn default_client_id(key: &str, endpoint: &str) -> String {
    if !endpoint.is_empty() && key == endpoint {
        endpoint.to_string()
    } else {
        format!("coap-bridge-{}-{}", key, uuid::Uuid::new_v4().simple())
    }
}

async fn receive_loop(
    key: String,
    transport: Arc<dyn BrokerTransport>,
    handler: Weak<dyn MessageHandler>,
    interval: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = liveness.tick() => {
                if !transport.is_connected() {
                    reconnect(&key, transport.as_ref()).await;
                }
                continue;
            }
            message = transport.receive() => {
                let Some(message) = message else {
                    tracing::debug!(key = %key, "transport closed its message stream");
                    break;
                };
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                handler.handle_message(&key, message).await;
            }
        }

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::debug!(key = %key, "receive task stopped");
}

/// Reopen a session the broker dropped. A failure is retried at the next
/// liveness check.
async fn reconnect(key: &str, transport: &dyn BrokerTransport) {
    tracing::warn!(key, "broker session lost, reconnecting");
    match transport.connect().await {
        Ok(()) => tracing::info!(key, "broker session restored"),
        Err(e) => tracing::warn!(key, error = %e, "reconnect failed, retrying later"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_id() {
        assert_eq!(default_client_id("dev1", "dev1"), "dev1");
        let shared = default_client_id("generic", "dev1");
        assert!(shared.starts_with("coap-bridge-generic-"));
        assert_ne!(shared, default_client_id("generic", "dev1"));
    }
}
