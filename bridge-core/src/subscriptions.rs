//! Tracked resource subscriptions.
//!
//! The registry is the bridge's view of which resources should be observed on
//! the device registry. The webhook validator replays it whenever the device
//! registry has lost its copy.

use tokio::sync::RwLock;

use crate::types::Subscription;

/// Thread-safe set of (domain, endpoint, resource path) triples.
///
/// An empty or absent domain is replaced with the configured default domain on
/// every call, so callers never special-case "no domain".
pub struct SubscriptionRegistry {
    default_domain: String,
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new(default_domain: impl Into<String>) -> Self {
        Self {
            default_domain: default_domain.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    /// The given domain, or the default when it is absent or empty.
    pub fn resolve_domain<'a>(&'a self, domain: Option<&'a str>) -> &'a str {
        match domain {
            Some(d) if !d.trim().is_empty() => d,
            _ => &self.default_domain,
        }
    }

    /// Track a subscription. Returns `false` if the triple was already present.
    pub async fn add(&self, domain: Option<&str>, endpoint: &str, resource_path: &str) -> bool {
        let domain = self.resolve_domain(domain);
        let mut entries = self.entries.write().await;
        if entries
            .iter()
            .any(|s| s.matches(domain, endpoint, resource_path))
        {
            return false;
        }

        tracing::debug!(domain, endpoint, resource_path, "tracking subscription");
        entries.push(Subscription::new(domain, endpoint, resource_path));
        true
    }

    /// Stop tracking a subscription. Returns whether an entry was removed.
    pub async fn remove(&self, domain: Option<&str>, endpoint: &str, resource_path: &str) -> bool {
        let domain = self.resolve_domain(domain);
        let mut entries = self.entries.write().await;
        match entries
            .iter()
            .position(|s| s.matches(domain, endpoint, resource_path))
        {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop every subscription of `endpoint`, in any domain. Returns how many
    /// entries were removed.
    pub async fn remove_all(&self, endpoint: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|s| !s.endpoint.eq_ignore_ascii_case(endpoint));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(endpoint, removed, "dropped endpoint subscriptions");
        }
        removed
    }

    pub async fn contains(&self, domain: Option<&str>, endpoint: &str, resource_path: &str) -> bool {
        let domain = self.resolve_domain(domain);
        self.entries
            .read()
            .await
            .iter()
            .any(|s| s.matches(domain, endpoint, resource_path))
    }

    /// Copy of every tracked subscription, in insertion order.
    pub async fn snapshot(&self) -> Vec<Subscription> {
        self.entries.read().await.clone()
    }

    /// Tracked subscriptions of one endpoint.
    pub async fn for_endpoint(&self, endpoint: &str) -> Vec<Subscription> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|s| s.endpoint.eq_ignore_ascii_case(endpoint))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let registry = SubscriptionRegistry::new("domain");
        assert!(registry.add(Some("domain"), "dev1", "/3303/0/5700").await);
        assert!(!registry.add(Some("domain"), "dev1", "/3303/0/5700").await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_domain_uses_default() {
        let registry = SubscriptionRegistry::new("domain");
        registry.add(None, "dev1", "/3303/0/5700").await;

        assert!(registry.contains(Some("domain"), "dev1", "/3303/0/5700").await);
        assert!(registry.contains(Some(""), "dev1", "/3303/0/5700").await);
        assert!(!registry.add(Some("  "), "dev1", "/3303/0/5700").await);

        assert!(registry.remove(None, "dev1", "/3303/0/5700").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_compare_ignores_case() {
        let registry = SubscriptionRegistry::new("domain");
        registry.add(Some("Domain"), "DEV1", "/3303/0/5700").await;
        assert!(registry.contains(Some("domain"), "dev1", "/3303/0/5700").await);
        assert!(!registry.add(Some("DOMAIN"), "Dev1", "/3303/0/5700").await);
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let registry = SubscriptionRegistry::new("domain");
        registry.add(None, "dev1", "/1/0/1").await;
        assert!(!registry.remove(None, "dev1", "/1/0/2").await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_all_for_endpoint() {
        let registry = SubscriptionRegistry::new("domain");
        registry.add(None, "dev1", "/3303/0/5700").await;
        registry.add(Some("other"), "dev1", "/3304/0/5700").await;
        registry.add(None, "dev2", "/3303/0/5700").await;

        assert_eq!(registry.remove_all("dev1").await, 2);
        assert!(registry.for_endpoint("dev1").await.is_empty());
        assert_eq!(registry.snapshot().await.len(), 1);
        assert_eq!(registry.remove_all("dev1").await, 0);
    }

    proptest! {
        #[test]
        fn prop_double_add_yields_one_entry(
            domain in "[a-zA-Z]{0,8}",
            endpoint in "[a-zA-Z0-9-]{1,12}",
            path in "(/[0-9]{1,5}){1,3}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let registry = SubscriptionRegistry::new("default");
                registry.add(Some(&domain), &endpoint, &path).await;
                registry.add(Some(&domain.to_uppercase()), &endpoint.to_lowercase(), &path).await;
                prop_assert_eq!(registry.len().await, 1);
                prop_assert!(registry.contains(Some(&domain), &endpoint, &path).await);
                Ok(())
            })?;
        }
    }
}
