//! reqwest-backed [`DeviceRegistryClient`].

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{
    AuthScheme, CoapVerb, DeviceRegistryClient, RegistryClientConfig, RegistryError,
    RegistryResponse,
};

/// Header name the registry echoes back on callback deliveries.
const AUTHENTICATION_HEADER: &str = "Authentication";

#[derive(Debug, Serialize)]
struct CallbackRegistration<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<&'static str, &'a str>,
}

#[derive(Debug, Deserialize)]
struct CallbackInfo {
    url: Option<String>,
}

/// HTTP client for the device registry.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    http: reqwest::Client,
    config: RegistryClientConfig,
}

impl HttpRegistryClient {
    pub fn new(config: RegistryClientConfig) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &RegistryClientConfig {
        &self.config
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Prefix for resource-level paths: `/{domain}` on the legacy API, `/v2`
    /// on the callback API where the domain is implied by the API key.
    fn scope(&self, domain: &str) -> String {
        match self.config.scheme {
            AuthScheme::Basic => format!("{}/{}", self.base(), domain),
            AuthScheme::SharedSecretCallback => format!("{}/v2", self.base()),
        }
    }

    fn subscription_url(&self, domain: &str, endpoint: &str, uri: &str) -> String {
        let url = format!(
            "{}/subscriptions/{}{}",
            self.scope(domain),
            endpoint,
            normalize_uri(uri)
        );
        self.with_sync(url)
    }

    fn resource_url(&self, domain: &str, endpoint: &str, uri: &str) -> String {
        let url = format!(
            "{}/endpoints/{}{}",
            self.scope(domain),
            endpoint,
            normalize_uri(uri)
        );
        self.with_sync(url)
    }

    fn callback_url(&self) -> String {
        match self.config.scheme {
            // The legacy push-url is scoped to the default domain.
            AuthScheme::Basic => format!("{}/notification/push-url", self.base()),
            AuthScheme::SharedSecretCallback => {
                format!("{}/v2/notification/callback", self.base())
            }
        }
    }

    fn with_sync(&self, url: String) -> String {
        if self.config.use_sync_param {
            format!("{url}?sync=true")
        } else {
            url
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.config.scheme {
            AuthScheme::SharedSecretCallback => match &self.config.api_key {
                Some(key) => builder.bearer_auth(key),
                None => builder,
            },
            AuthScheme::Basic => match &self.config.username {
                Some(user) => builder.basic_auth(user, self.config.password.as_ref()),
                None => builder,
            },
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<RegistryResponse, RegistryError> {
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        tracing::trace!(status, bytes = body.len(), "registry response");
        Ok(RegistryResponse { status, body })
    }
}

/// Resource paths are always sent with a single leading slash.
fn normalize_uri(uri: &str) -> String {
    if uri.is_empty() {
        String::new()
    } else {
        format!("/{}", uri.trim_start_matches('/'))
    }
}

#[async_trait]
impl DeviceRegistryClient for HttpRegistryClient {
    async fn subscribe(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError> {
        let url = self.subscription_url(domain, endpoint, uri);
        tracing::debug!(%url, "subscribing resource");
        self.send(self.request(Method::PUT, &url)).await
    }

    async fn unsubscribe(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError> {
        let url = self.subscription_url(domain, endpoint, uri);
        tracing::debug!(%url, "unsubscribing resource");
        self.send(self.request(Method::DELETE, &url)).await
    }

    async fn check_subscription(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError> {
        let url = format!(
            "{}/subscriptions/{}{}",
            self.scope(domain),
            endpoint,
            normalize_uri(uri)
        );
        self.send(self.request(Method::GET, &url)).await
    }

    async fn discover_devices(
        &self,
        domain: &str,
        endpoint_type: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError> {
        let url = format!("{}/endpoints", self.scope(domain));
        let mut builder = self.request(Method::GET, &url);
        if let Some(ept) = endpoint_type {
            builder = builder.query(&[("type", ept)]);
        }
        self.send(builder).await
    }

    async fn discover_resources(
        &self,
        domain: &str,
        endpoint: &str,
    ) -> Result<RegistryResponse, RegistryError> {
        let url = format!("{}/endpoints/{}", self.scope(domain), endpoint);
        self.send(self.request(Method::GET, &url)).await
    }

    async fn dispatch_operation(
        &self,
        domain: &str,
        verb: CoapVerb,
        endpoint: &str,
        uri: &str,
        value: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError> {
        let url = self.resource_url(domain, endpoint, uri);
        let method = match verb {
            CoapVerb::Get => Method::GET,
            CoapVerb::Put => Method::PUT,
            CoapVerb::Post => Method::POST,
            CoapVerb::Delete => Method::DELETE,
        };
        tracing::debug!(%url, %verb, "dispatching resource operation");

        let mut builder = self.request(method, &url);
        if let (Some(value), CoapVerb::Put | CoapVerb::Post) = (value, verb) {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(value.to_string());
        }
        self.send(builder).await
    }

    async fn install_callback(
        &self,
        url: &str,
        authentication: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError> {
        let target = self.callback_url();
        let builder = match self.config.scheme {
            AuthScheme::Basic => self
                .request(Method::PUT, &target)
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(url.to_string()),
            AuthScheme::SharedSecretCallback => {
                let mut headers = HashMap::new();
                if let Some(auth) = authentication {
                    headers.insert(AUTHENTICATION_HEADER, auth);
                }
                self.request(Method::PUT, &target)
                    .json(&CallbackRegistration { url, headers })
            }
        };
        tracing::debug!(callback = url, "installing webhook");
        self.send(builder).await
    }

    async fn reset_callback(&self) -> Result<RegistryResponse, RegistryError> {
        match self.config.scheme {
            AuthScheme::Basic => Err(RegistryError::Unsupported("basic")),
            AuthScheme::SharedSecretCallback => {
                let target = self.callback_url();
                self.send(self.request(Method::DELETE, &target)).await
            }
        }
    }

    async fn get_callback(&self) -> Result<Option<String>, RegistryError> {
        let response = self.send(self.request(Method::GET, &self.callback_url())).await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(RegistryError::InvalidResponse(format!(
                "callback lookup failed: HTTP {}",
                response.status
            )));
        }

        match self.config.scheme {
            AuthScheme::Basic => {
                let url = response.body.trim();
                Ok((!url.is_empty()).then(|| url.to_string()))
            }
            AuthScheme::SharedSecretCallback => {
                let info: CallbackInfo = serde_json::from_str(&response.body)
                    .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
                Ok(info.url.filter(|url| !url.is_empty()))
            }
        }
    }
}
