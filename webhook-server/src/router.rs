//! Routing of webhook deliveries to the bridge.
//!
//! The `WebhookRouter` keeps the set of callback paths this process has
//! installed on the device registry and forwards each delivery on one of those
//! paths to a channel.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// One webhook delivery as received over HTTP.
///
/// The body is left unparsed; decoding into a notification batch is the
/// consumer's concern.
#[derive(Debug, Clone)]
pub struct WebhookPayload {
    /// Locally generated id used to correlate log lines for this delivery
    pub request_id: Uuid,
    /// Request path the registry posted to
    pub path: String,
    /// Value of the `Authentication` header, if the registry sent one
    pub authentication: Option<String>,
    /// Raw request body
    pub body: String,
}

/// Routes webhook deliveries from the HTTP layer to a channel.
#[derive(Clone)]
pub struct WebhookRouter {
    /// Callback paths accepted by this server
    paths: Arc<RwLock<HashSet<String>>>,
    /// Channel for delivered payloads
    sender: mpsc::UnboundedSender<WebhookPayload>,
}

impl WebhookRouter {
    /// Create a new router forwarding to `sender`.
    ///
    /// ```
    /// use tokio::sync::mpsc;
    /// use webhook_server::router::{WebhookPayload, WebhookRouter};
    ///
    /// let (tx, _rx) = mpsc::unbounded_channel::<WebhookPayload>();
    /// let router = WebhookRouter::new(tx);
    /// ```
    pub fn new(sender: mpsc::UnboundedSender<WebhookPayload>) -> Self {
        Self {
            paths: Arc::new(RwLock::new(HashSet::new())),
            sender,
        }
    }

    /// Accept deliveries on `path`.
    pub async fn register(&self, path: impl Into<String>) {
        let path = normalize_path(&path.into());
        self.paths.write().await.insert(path);
    }

    /// Stop accepting deliveries on `path`.
    pub async fn unregister(&self, path: &str) {
        self.paths.write().await.remove(&normalize_path(path));
    }

    /// Whether deliveries on `path` are accepted.
    pub async fn is_registered(&self, path: &str) -> bool {
        self.paths.read().await.contains(&normalize_path(path))
    }

    /// Forward a delivery to the channel.
    ///
    /// Returns `false` when the path is not registered; the payload is then
    /// dropped. A closed receiver is not an error for the HTTP side, the
    /// registry is acknowledged either way.
    pub async fn route(
        &self,
        path: &str,
        authentication: Option<String>,
        body: String,
    ) -> bool {
        if !self.is_registered(path).await {
            return false;
        }

        let payload = WebhookPayload {
            request_id: Uuid::new_v4(),
            path: normalize_path(path),
            authentication,
            body,
        };

        if self.sender.send(payload).is_err() {
            tracing::warn!(path, "webhook receiver dropped, delivery discarded");
        }
        true
    }
}

/// Paths are compared without a trailing slash so `/notify` and `/notify/`
/// are the same callback.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
