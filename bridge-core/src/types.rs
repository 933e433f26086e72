//! Core types shared across the bridge.

use serde::Serialize;

use crate::batch::ResourceInfo;

/// One observed resource on the device registry.
///
/// Identity is the (domain, endpoint, resource path) triple, compared
/// case-insensitively on every field.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub domain: String,
    pub endpoint: String,
    pub resource_path: String,
}

impl Subscription {
    pub fn new(
        domain: impl Into<String>,
        endpoint: impl Into<String>,
        resource_path: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            endpoint: endpoint.into(),
            resource_path: resource_path.into(),
        }
    }

    /// Whether this entry names the same triple.
    pub fn matches(&self, domain: &str, endpoint: &str, resource_path: &str) -> bool {
        self.domain.eq_ignore_ascii_case(domain)
            && self.endpoint.eq_ignore_ascii_case(endpoint)
            && self.resource_path.eq_ignore_ascii_case(resource_path)
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.domain, &other.endpoint, &other.resource_path)
    }
}

impl Eq for Subscription {}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}{}", self.domain, self.endpoint, self.resource_path)
    }
}

/// How a backend maps endpoints onto broker connections.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionMode {
    /// One connection carries traffic for every endpoint
    Shared,
    /// Each endpoint gets its own connection (and broker identity)
    PerEndpoint,
}

/// What a backend's device registrar learns about a newly registered endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointMetadata {
    /// Endpoint name
    pub name: String,
    /// Endpoint type as reported at registration
    pub endpoint_type: String,
    /// Domain the endpoint lives in
    pub domain: String,
    /// Resources listed in the registration event
    pub resources: Vec<ResourceInfo>,
    /// Extended metadata pulled from resource discovery, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_identity_ignores_case() {
        let a = Subscription::new("Domain", "Dev1", "/3303/0/5700");
        let b = Subscription::new("domain", "dev1", "/3303/0/5700");
        assert_eq!(a, b);
        assert!(a.matches("DOMAIN", "DEV1", "/3303/0/5700"));
        assert!(!a.matches("domain", "dev2", "/3303/0/5700"));
    }

    #[test]
    fn test_subscription_display() {
        let sub = Subscription::new("domain", "dev1", "/3303/0/5700");
        assert_eq!(sub.to_string(), "domain/dev1/3303/0/5700");
    }
}
