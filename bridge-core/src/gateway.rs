//! Webhook registration on the device registry.
//!
//! The gateway owns the webhook state: the URL it believes is installed, the
//! scheme in use and the authentication hash inbound deliveries must carry.
//! The hash is computed once at construction.

use registry_client::{AuthScheme, DeviceRegistryClient};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::batch::NotificationBatch;
use crate::config::{RegistryConfig, WebhookConfig};

/// Lowercase hex SHA-256 of the API key followed by the optional salt.
pub fn compute_authentication_hash(api_key: &str, salt: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    if let Some(salt) = salt {
        hasher.update(salt.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub struct WebhookGateway {
    client: Arc<dyn DeviceRegistryClient>,
    scheme: AuthScheme,
    expected_url: String,
    legacy_default_url: Option<String>,
    skip_validation: bool,
    authentication: Option<String>,
    installed_url: RwLock<Option<String>>,
}

impl WebhookGateway {
    /// `expected_url` is the externally reachable callback URL of this process.
    pub fn new(
        client: Arc<dyn DeviceRegistryClient>,
        registry: &RegistryConfig,
        webhook: &WebhookConfig,
        expected_url: impl Into<String>,
    ) -> Self {
        let authentication = match registry.scheme {
            AuthScheme::SharedSecretCallback => registry
                .api_key
                .as_deref()
                .map(|key| compute_authentication_hash(key, webhook.hash_salt.as_deref())),
            AuthScheme::Basic => None,
        };

        if webhook.skip_validation {
            tracing::warn!("webhook validation is disabled, every delivery will be accepted");
        }

        Self {
            client,
            scheme: registry.scheme,
            expected_url: expected_url.into(),
            legacy_default_url: webhook.legacy_default_url.clone(),
            skip_validation: webhook.skip_validation,
            authentication,
            installed_url: RwLock::new(None),
        }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn expected_url(&self) -> &str {
        &self.expected_url
    }

    /// URL this gateway last installed and confirmed.
    pub async fn installed_url(&self) -> Option<String> {
        self.installed_url.read().await.clone()
    }

    /// URL the registry currently reports, `None` if none or unreadable.
    pub async fn registry_url(&self) -> Option<String> {
        match self.client.get_callback().await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "could not read installed webhook");
                None
            }
        }
    }

    /// Install `target_url` as the registry's webhook. Returns whether the
    /// registry ends up pointing at it.
    pub async fn install(&self, target_url: &str) -> bool {
        let installed = if self.scheme.requires_header_refresh() {
            self.install_with_refresh(target_url).await
        } else {
            self.install_if_changed(target_url).await
        };

        *self.installed_url.write().await = installed.then(|| target_url.to_string());
        if installed {
            tracing::info!(url = target_url, scheme = %self.scheme, "webhook installed");
        } else {
            tracing::error!(url = target_url, scheme = %self.scheme, "webhook installation failed");
        }
        installed
    }

    async fn install_if_changed(&self, target_url: &str) -> bool {
        if self.registry_url().await.as_deref() == Some(target_url) {
            tracing::debug!(url = target_url, "webhook already installed");
            return true;
        }

        match self.client.install_callback(target_url, None).await {
            Ok(response) if response.is_success() => true,
            Ok(response) => {
                tracing::warn!(status = response.status, body = %response.body, "push-url rejected");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "push-url install failed");
                false
            }
        }
    }

    /// The header is only refreshed by re-creating the registration, so the
    /// old one is always deleted first.
    async fn install_with_refresh(&self, target_url: &str) -> bool {
        if let Err(e) = self.client.reset_callback().await {
            tracing::warn!(error = %e, "could not delete previous callback");
        }

        match self
            .client
            .install_callback(target_url, self.authentication.as_deref())
            .await
        {
            Ok(response) if !response.is_success() => {
                tracing::warn!(status = response.status, body = %response.body, "callback rejected");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "callback install failed"),
        }

        self.registry_url().await.as_deref() == Some(target_url)
    }

    /// Remove the webhook. The legacy scheme cannot unset its push-url, so
    /// the configured default URL is installed instead.
    pub async fn reset(&self) -> bool {
        *self.installed_url.write().await = None;

        let result = match self.scheme {
            AuthScheme::SharedSecretCallback => self.client.reset_callback().await,
            AuthScheme::Basic => {
                let Some(default_url) = self.legacy_default_url.as_deref() else {
                    tracing::debug!("no default push-url configured, nothing to reset");
                    return true;
                };
                self.client.install_callback(default_url, None).await
            }
        };

        match result {
            // Nothing to delete is as good as deleted.
            Ok(response) if response.is_success() || response.status == 404 => true,
            Ok(response) => {
                tracing::warn!(status = response.status, "webhook reset rejected");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "webhook reset failed");
                false
            }
        }
    }

    /// Whether an inbound delivery may be processed.
    pub fn validate_inbound(&self, authentication: Option<&str>) -> bool {
        if !self.scheme.is_validatable() {
            return true;
        }

        let valid = matches!(
            (self.authentication.as_deref(), authentication),
            (Some(expected), Some(received)) if expected == received.trim()
        );
        if valid {
            return true;
        }

        if self.skip_validation {
            tracing::warn!("webhook authentication mismatch ignored, validation is disabled");
            return true;
        }

        tracing::warn!(
            present = authentication.is_some(),
            "webhook delivery failed authentication, dropped"
        );
        false
    }

    pub fn decode_batch(&self, body: &str) -> Option<NotificationBatch> {
        NotificationBatch::decode(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_lowercase_hex_sha256() {
        let hash = compute_authentication_hash("key", None);
        assert_eq!(
            hash,
            "2c70e12b7a0646f92279f427c7b38e7334d8e5389cff167a1dc30e73f826b683"
        );
        assert_ne!(hash, compute_authentication_hash("key", Some("salt")));
    }
}
