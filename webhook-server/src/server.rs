//! HTTP server receiving device registry webhook deliveries.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use warp::Filter;

use crate::error::WebhookServerError;
use crate::router::{WebhookPayload, WebhookRouter};

/// Largest webhook body accepted, in bytes.
const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;

/// Settings for [`WebhookServer`].
#[derive(Debug, Clone)]
pub struct WebhookServerConfig {
    /// Range of ports to try binding to (inclusive)
    /// Default: (28519, 28619)
    pub port_range: (u16, u16),

    /// Address the listener binds to
    /// Default: 0.0.0.0
    pub bind_address: IpAddr,

    /// Base URL advertised to the registry instead of the detected local
    /// address, e.g. when the bridge sits behind NAT or a load balancer
    pub advertised_base_url: Option<String>,
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            port_range: (28519, 28619),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertised_base_url: None,
        }
    }
}

/// HTTP server accepting webhook deliveries from the device registry.
///
/// Every delivery on a registered path is acknowledged with `200 OK`, whether
/// or not its body later turns out to be valid. Unregistered paths get `404`.
///
/// ```no_run
/// use tokio::sync::mpsc;
/// use webhook_server::{WebhookServer, WebhookServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let (tx, _rx) = mpsc::unbounded_channel();
///     let server = WebhookServer::new(WebhookServerConfig::default(), tx)
///         .await
///         .expect("webhook server failed to start");
///     server.router().register("/notify").await;
///     server.shutdown().await.expect("clean shutdown");
/// }
/// ```
pub struct WebhookServer {
    /// The port the server is bound to
    port: u16,
    /// Base URL used to build callback URLs
    base_url: String,
    /// Router for accepted callback paths
    router: Arc<WebhookRouter>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server task handle
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl WebhookServer {
    /// Bind and start the server.
    ///
    /// Finds a free port in `config.port_range`, works out the base URL (the
    /// advertised one if configured, otherwise `http://<local ip>:<port>`) and
    /// waits until the listener is accepting connections before returning.
    pub async fn new(
        config: WebhookServerConfig,
        sender: mpsc::UnboundedSender<WebhookPayload>,
    ) -> Result<Self, WebhookServerError> {
        let (start, end) = config.port_range;
        let port = Self::find_available_port(config.bind_address, start, end)
            .ok_or(WebhookServerError::NoAvailablePort { start, end })?;

        let base_url = match &config.advertised_base_url {
            Some(advertised) => {
                let parsed = url::Url::parse(advertised)
                    .map_err(|_| WebhookServerError::InvalidAdvertisedUrl(advertised.clone()))?;
                parsed.as_str().trim_end_matches('/').to_string()
            }
            None => {
                let local_ip =
                    Self::detect_local_ip().ok_or(WebhookServerError::LocalAddressUnavailable)?;
                format!("http://{local_ip}:{port}")
            }
        };

        let router = Arc::new(WebhookRouter::new(sender));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        let server_handle = Self::start_server(
            SocketAddr::new(config.bind_address, port),
            router.clone(),
            shutdown_rx,
            ready_tx,
        );

        ready_rx
            .await
            .map_err(|_| WebhookServerError::StartupFailed)?;

        Ok(Self {
            port,
            base_url,
            router,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// Base URL of this server, without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full callback URL for `path`, suitable for installing on the registry.
    pub fn callback_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Get the port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Router used to register accepted callback paths.
    pub fn router(&self) -> &Arc<WebhookRouter> {
        &self.router
    }

    /// Stop accepting deliveries and wait for in-flight requests to finish.
    pub async fn shutdown(mut self) -> Result<(), WebhookServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| WebhookServerError::ShutdownFailed(e.to_string()))?;
        }

        tracing::info!(port = self.port, "webhook server stopped");
        Ok(())
    }

    /// Find an available port in the given range.
    fn find_available_port(address: IpAddr, start: u16, end: u16) -> Option<u16> {
        (start..=end).find(|&port| Self::is_port_available(address, port))
    }

    /// Check if a port is available for binding.
    fn is_port_available(address: IpAddr, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(address, port)).is_ok()
    }

    /// Detect the local IP address for callback URLs.
    ///
    /// Uses a UDP socket "connected" to a public address to learn which local
    /// interface routes outbound traffic. No data is sent.
    ///
    /// This is a fallback for local setups only. Behind NAT or a proxy the
    /// detected address is not what the registry can reach, so production
    /// deployments set `advertised_base_url`, which skips detection.
    fn detect_local_ip() -> Option<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }

    /// Start the HTTP server on the given address.
    fn start_server(
        addr: SocketAddr,
        router: Arc<WebhookRouter>,
        shutdown_rx: oneshot::Receiver<()>,
        ready_tx: oneshot::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // The registry uses PUT for legacy push-url deliveries and POST for
            // callback deliveries; both carry the same batch format.
            let delivery_route = warp::put()
                .or(warp::post())
                .unify()
                .and(warp::path::full())
                .and(warp::header::optional::<String>("authentication"))
                .and(warp::body::content_length_limit(MAX_BODY_BYTES))
                .and(warp::body::bytes())
                .and_then({
                    let router = router.clone();
                    move |path: warp::path::FullPath,
                          authentication: Option<String>,
                          body: bytes::Bytes| {
                        let router = router.clone();
                        async move {
                            let body = String::from_utf8_lossy(&body).into_owned();
                            tracing::debug!(
                                path = path.as_str(),
                                bytes = body.len(),
                                authenticated = authentication.is_some(),
                                "webhook delivery received"
                            );

                            if router.route(path.as_str(), authentication, body).await {
                                Ok::<_, warp::Rejection>(warp::reply::with_status(
                                    "",
                                    warp::http::StatusCode::OK,
                                ))
                            } else {
                                tracing::warn!(
                                    path = path.as_str(),
                                    "webhook delivery on unregistered path"
                                );
                                Err(warp::reject::not_found())
                            }
                        }
                    }
                });

            let routes = delivery_route.recover(handle_rejection);

            let bound = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
                let _ = shutdown_rx.await;
            });

            match bound {
                Ok((local_addr, server)) => {
                    tracing::info!(%local_addr, "webhook server listening");
                    let _ = ready_tx.send(());
                    server.await;
                }
                Err(e) => {
                    // Dropping ready_tx reports the failure to `new`.
                    tracing::error!(%addr, error = %e, "webhook server failed to bind");
                }
            }
        })
    }
}

/// Handle rejections and convert them to HTTP responses.
async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let (code, message) = if err.is_not_found() {
        (warp::http::StatusCode::NOT_FOUND, "Unknown callback path")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (warp::http::StatusCode::PAYLOAD_TOO_LARGE, "Payload too large")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (warp::http::StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    } else {
        (
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
        )
    };

    Ok(warp::reply::with_status(message, code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    #[test]
    fn test_is_port_available() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!WebhookServer::is_port_available(any_address(), port));
        drop(listener);
    }

    #[test]
    fn test_find_available_port() {
        let port = WebhookServer::find_available_port(any_address(), 51000, 51100);
        assert!(port.is_some());
        let port = port.unwrap();
        assert!((51000..=51100).contains(&port));
    }

    #[tokio::test]
    async fn test_server_with_advertised_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = WebhookServerConfig {
            port_range: (51100, 51200),
            advertised_base_url: Some("https://bridge.example.com/".to_string()),
            ..Default::default()
        };

        let server = WebhookServer::new(config, tx).await.unwrap();
        assert_eq!(server.base_url(), "https://bridge.example.com");
        assert_eq!(
            server.callback_url("/notify"),
            "https://bridge.example.com/notify"
        );

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_invalid_advertised_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = WebhookServerConfig {
            port_range: (51200, 51300),
            advertised_base_url: Some("not a url".to_string()),
            ..Default::default()
        };

        let result = WebhookServer::new(config, tx).await;
        assert!(matches!(
            result,
            Err(WebhookServerError::InvalidAdvertisedUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_server_register_unregister() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = WebhookServerConfig {
            port_range: (51300, 51400),
            advertised_base_url: Some("http://127.0.0.1:9".to_string()),
            ..Default::default()
        };
        let server = WebhookServer::new(config, tx).await.unwrap();

        server.router().register("/notify").await;
        assert!(server.router().is_registered("/notify").await);
        server.router().unregister("/notify").await;
        assert!(!server.router().is_registered("/notify").await);

        server.shutdown().await.unwrap();
    }
}
