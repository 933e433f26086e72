//! Backend device registrars.
//!
//! A registrar mirrors registry endpoints into a backend's own device records
//! and hands out the broker credentials each endpoint connects with. Cloud
//! backends provision devices through vendor APIs; [`StaticRegistrar`] is the
//! plain-broker case where every endpoint shares configured credentials.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::backend::format::{substitute_placeholders, ENDPOINT_PLACEHOLDER};
use crate::config::MqttConfig;
use crate::types::EndpointMetadata;

/// Errors from device registrars.
#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    /// Credential material could not be loaded
    #[error("Credentials unavailable for {endpoint}: {reason}")]
    Credentials {
        endpoint: String,
        reason: String,
    },

    /// The backend refused to create or delete a device record
    #[error("Provisioning failed: {0}")]
    Provisioning(String),
}

/// Broker credentials for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointCredentials {
    /// MQTT client id; the multiplexer picks one when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM bytes
    pub ca_pem: Option<Vec<u8>>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
}

/// Backend-side device bookkeeping.
#[async_trait]
pub trait DeviceRegistrar: Send + Sync {
    /// Create (or refresh) the backend record for an endpoint. Returns whether
    /// the endpoint was new to the backend.
    async fn register_new_device(&self, metadata: &EndpointMetadata) -> Result<bool, RegistrarError>;

    /// Delete the backend record. Returns whether one existed.
    async fn deregister_device(&self, endpoint: &str) -> Result<bool, RegistrarError>;

    /// Credentials the endpoint's broker connection uses.
    async fn get_endpoint_credentials(
        &self,
        endpoint: &str,
    ) -> Result<EndpointCredentials, RegistrarError>;
}

/// Registrar for brokers without device provisioning.
///
/// Keeps an in-memory record of registered endpoints and returns the same
/// configured credentials for all of them; only the client id varies per
/// endpoint when the configured template contains `__EPNAME__`.
pub struct StaticRegistrar {
    client_id_template: Option<String>,
    credentials: EndpointCredentials,
    devices: RwLock<HashMap<String, EndpointMetadata>>,
}

impl StaticRegistrar {
    pub fn new(client_id_template: Option<String>, credentials: EndpointCredentials) -> Self {
        Self {
            client_id_template,
            credentials,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Build from a router's broker settings, reading any PEM files.
    pub fn from_config(config: &MqttConfig) -> Result<Self, RegistrarError> {
        let read = |path: &Option<String>| -> Result<Option<Vec<u8>>, RegistrarError> {
            match path {
                Some(path) => std::fs::read(path)
                    .map(Some)
                    .map_err(|e| RegistrarError::Credentials {
                        endpoint: "*".to_string(),
                        reason: format!("{path}: {e}"),
                    }),
                None => Ok(None),
            }
        };

        let credentials = EndpointCredentials {
            client_id: None,
            username: config.username.clone(),
            password: config.password.clone(),
            ca_pem: read(&config.ca_cert_path)?,
            client_cert_pem: read(&config.client_cert_path)?,
            client_key_pem: read(&config.client_key_path)?,
        };
        Ok(Self::new(config.client_id.clone(), credentials))
    }

    /// Metadata recorded for an endpoint.
    pub async fn device(&self, endpoint: &str) -> Option<EndpointMetadata> {
        self.devices.read().await.get(endpoint).cloned()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }
}

#[async_trait]
impl DeviceRegistrar for StaticRegistrar {
    async fn register_new_device(&self, metadata: &EndpointMetadata) -> Result<bool, RegistrarError> {
        let previous = self
            .devices
            .write()
            .await
            .insert(metadata.name.clone(), metadata.clone());
        tracing::debug!(
            endpoint = %metadata.name,
            endpoint_type = %metadata.endpoint_type,
            new = previous.is_none(),
            "device recorded"
        );
        Ok(previous.is_none())
    }

    async fn deregister_device(&self, endpoint: &str) -> Result<bool, RegistrarError> {
        Ok(self.devices.write().await.remove(endpoint).is_some())
    }

    async fn get_endpoint_credentials(
        &self,
        endpoint: &str,
    ) -> Result<EndpointCredentials, RegistrarError> {
        let mut credentials = self.credentials.clone();
        credentials.client_id = self.client_id_template.as_deref().and_then(|template| {
            // A shared connection has no endpoint to fill in; the multiplexer
            // generates a unique id instead.
            if endpoint.is_empty() && template.contains(ENDPOINT_PLACEHOLDER) {
                return None;
            }
            Some(substitute_placeholders(template, endpoint, "", ""))
        });
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(name: &str) -> EndpointMetadata {
        EndpointMetadata {
            name: name.to_string(),
            endpoint_type: "sensor".to_string(),
            domain: "domain".to_string(),
            resources: Vec::new(),
            details: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let registrar = StaticRegistrar::new(None, EndpointCredentials::default());
        assert!(registrar.register_new_device(&metadata("dev1")).await.unwrap());
        assert!(!registrar.register_new_device(&metadata("dev1")).await.unwrap());
        assert_eq!(registrar.device_count().await, 1);

        assert!(registrar.deregister_device("dev1").await.unwrap());
        assert!(!registrar.deregister_device("dev1").await.unwrap());
        assert!(registrar.device("dev1").await.is_none());
    }

    #[tokio::test]
    async fn test_client_id_template() {
        let credentials = EndpointCredentials {
            username: Some("bridge".to_string()),
            ..Default::default()
        };
        let registrar = StaticRegistrar::new(Some("d:org:__EPNAME__".to_string()), credentials);

        let creds = registrar.get_endpoint_credentials("dev1").await.unwrap();
        assert_eq!(creds.client_id.as_deref(), Some("d:org:dev1"));
        assert_eq!(creds.username.as_deref(), Some("bridge"));

        let shared = registrar.get_endpoint_credentials("").await.unwrap();
        assert!(shared.client_id.is_none());
        assert_eq!(shared.username.as_deref(), Some("bridge"));

        let fixed = StaticRegistrar::new(Some("bridge-01".to_string()), EndpointCredentials::default());
        let creds = fixed.get_endpoint_credentials("").await.unwrap();
        assert_eq!(creds.client_id.as_deref(), Some("bridge-01"));

        let untemplated = StaticRegistrar::new(None, EndpointCredentials::default());
        let creds = untemplated.get_endpoint_credentials("dev1").await.unwrap();
        assert!(creds.client_id.is_none());
    }

    #[test]
    fn test_missing_pem_file_is_an_error() {
        let config = MqttConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            StaticRegistrar::from_config(&config),
            Err(RegistrarError::Credentials { .. })
        ));
    }
}
