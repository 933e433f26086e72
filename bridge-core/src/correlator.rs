//! Async-response correlation.
//!
//! Some registry operations answer with only an `async-response-id`; the real
//! result arrives later in an `async-responses` webhook batch. The correlator
//! remembers, per id, everything needed to format and deliver that result.
//!
//! Entries are removed before any reply is published, so a duplicated webhook
//! delivery cannot publish a reply twice. Entries whose result never arrives
//! expire after a configurable TTL.
//!
//! The correlator never holds a broker connection. A reply is handed back to
//! the router that recorded the request, which publishes it over whatever
//! connection currently serves the recorded connection key, if any.

use async_trait::async_trait;
use registry_client::{CoapVerb, RegistryResponse};
use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::batch::{decode_coap_payload, AsyncResponse};

/// Formats and publishes the reply for a resolved async request.
/// Implemented by routers.
#[async_trait]
pub trait AsyncReplySink: Send + Sync {
    /// `value` is the decoded payload of the async response, if any. Returns
    /// whether a reply was published.
    async fn deliver_async_reply(
        &self,
        request: &PendingAsyncRequest,
        value: Option<&str>,
        event: &AsyncResponse,
    ) -> bool;
}

/// What the router knew when it dispatched the request.
#[derive(Debug, Clone)]
pub struct PendingAsyncRequest {
    pub async_id: String,
    /// Multiplexer key of the connection the command arrived on
    pub connection_key: String,
    pub verb: CoapVerb,
    pub endpoint: String,
    pub resource_path: String,
    pub response_topic: String,
    pub reply_topic: Option<String>,
    pub raw_request: String,
    pub recorded_at: Instant,
}

impl PendingAsyncRequest {
    /// The reply topic for GETs that named one, else the response topic.
    pub fn delivery_topic(&self) -> &str {
        match (&self.verb, &self.reply_topic) {
            (CoapVerb::Get, Some(reply_topic)) => reply_topic,
            _ => &self.response_topic,
        }
    }
}

/// Request context supplied by the caller of [`AsyncResponseCorrelator::record_pending`];
/// the id comes from the registry response.
#[derive(Debug, Clone)]
pub struct PendingContext {
    pub connection_key: String,
    pub verb: CoapVerb,
    pub endpoint: String,
    pub resource_path: String,
    pub response_topic: String,
    pub reply_topic: Option<String>,
    pub raw_request: String,
}

struct PendingEntry {
    request: PendingAsyncRequest,
    sink: Weak<dyn AsyncReplySink>,
}

/// Map of async-response id to pending request.
pub struct AsyncResponseCorrelator {
    pending: Mutex<HashMap<String, PendingEntry>>,
    ttl: Duration,
}

impl AsyncResponseCorrelator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record a request whose response carried an async-response id.
    ///
    /// Returns the id, or `None` when the response has no usable id. A second
    /// record under the same id replaces the first.
    pub async fn record_pending(
        &self,
        response: &RegistryResponse,
        context: PendingContext,
        sink: Weak<dyn AsyncReplySink>,
    ) -> Option<String> {
        let Some(async_id) = response.async_response_id() else {
            tracing::warn!(
                endpoint = %context.endpoint,
                "async marker without a readable id, request dropped"
            );
            return None;
        };

        let request = PendingAsyncRequest {
            async_id: async_id.clone(),
            connection_key: context.connection_key,
            verb: context.verb,
            endpoint: context.endpoint,
            resource_path: context.resource_path,
            response_topic: context.response_topic,
            reply_topic: context.reply_topic,
            raw_request: context.raw_request,
            recorded_at: Instant::now(),
        };

        let mut pending = self.pending.lock().await;
        Self::purge_locked(&mut pending, self.ttl);
        if pending
            .insert(async_id.clone(), PendingEntry { request, sink })
            .is_some()
        {
            tracing::debug!(async_id = %async_id, "pending async request replaced");
        }
        tracing::debug!(async_id = %async_id, pending = pending.len(), "async request pending");
        Some(async_id)
    }

    /// Deliver the result of an async response. Returns whether a reply was
    /// published.
    ///
    /// Unknown ids are dropped silently. A known id is removed before
    /// anything else happens, whether or not a reply results.
    pub async fn resolve(&self, event: &AsyncResponse) -> bool {
        let entry = self.pending.lock().await.remove(&event.id);
        let Some(entry) = entry else {
            tracing::debug!(async_id = %event.id, "no pending request for async response");
            return false;
        };
        let Some(sink) = entry.sink.upgrade() else {
            tracing::debug!(async_id = %event.id, "router gone, async response dropped");
            return false;
        };

        let value = event.payload.as_deref().and_then(decode_coap_payload);
        tracing::debug!(
            async_id = %event.id,
            key = %entry.request.connection_key,
            topic = entry.request.delivery_topic(),
            "delivering async response"
        );
        sink.deliver_async_reply(&entry.request, value.as_deref(), event)
            .await
    }

    /// Forget every pending request of `endpoint`. Returns how many were
    /// dropped.
    pub async fn remove_for_endpoint(&self, endpoint: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, entry| !entry.request.endpoint.eq_ignore_ascii_case(endpoint));
        before - pending.len()
    }

    pub async fn contains(&self, async_id: &str) -> bool {
        self.pending.lock().await.contains_key(async_id)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Drop entries older than the TTL. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut pending = self.pending.lock().await;
        Self::purge_locked(&mut pending, self.ttl)
    }

    fn purge_locked(pending: &mut HashMap<String, PendingEntry>, ttl: Duration) -> usize {
        let before = pending.len();
        pending.retain(|id, entry| {
            let keep = entry.request.recorded_at.elapsed() < ttl;
            if !keep {
                tracing::info!(async_id = %id, endpoint = %entry.request.endpoint, "async request expired");
            }
            keep
        });
        before - pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records what would be published instead of publishing it.
    #[derive(Default)]
    struct RecordingSink {
        delivered: std::sync::Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingSink {
        fn delivered(&self) -> Vec<(String, String, String)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AsyncReplySink for RecordingSink {
        async fn deliver_async_reply(
            &self,
            request: &PendingAsyncRequest,
            value: Option<&str>,
            _event: &AsyncResponse,
        ) -> bool {
            let Some(value) = value else {
                return false;
            };
            self.delivered.lock().unwrap().push((
                request.connection_key.clone(),
                request.delivery_topic().to_string(),
                value.to_string(),
            ));
            true
        }
    }

    fn weak(sink: &Arc<RecordingSink>) -> Weak<dyn AsyncReplySink> {
        let as_dyn: Arc<dyn AsyncReplySink> = sink.clone();
        Arc::downgrade(&as_dyn)
    }

    fn context(verb: CoapVerb, reply_topic: Option<&str>) -> PendingContext {
        PendingContext {
            connection_key: "generic".into(),
            verb,
            endpoint: "dev1".into(),
            resource_path: "/3303/0/5700".into(),
            response_topic: "mbed/domain/endpoints/dev1/3303/0/5700".into(),
            reply_topic: reply_topic.map(str::to_string),
            raw_request: String::new(),
        }
    }

    fn event(id: &str, payload: Option<&str>) -> AsyncResponse {
        AsyncResponse {
            id: id.into(),
            status: Some(200),
            payload: payload.map(str::to_string),
            error: None,
        }
    }

    fn marker(id: &str) -> RegistryResponse {
        RegistryResponse::new(202, format!(r#"{{"async-response-id":"{id}"}}"#))
    }

    #[tokio::test]
    async fn test_resolve_is_at_most_once() {
        let correlator = AsyncResponseCorrelator::new(Duration::from_secs(300));
        let sink = Arc::new(RecordingSink::default());

        let id = correlator
            .record_pending(
                &marker("abc123"),
                context(CoapVerb::Get, Some("replies/dev1")),
                weak(&sink),
            )
            .await;
        assert_eq!(id.as_deref(), Some("abc123"));
        assert!(correlator.contains("abc123").await);

        assert!(correlator.resolve(&event("abc123", Some("MjkuNzU="))).await);
        assert!(!correlator.resolve(&event("abc123", Some("MjkuNzU="))).await);
        assert!(!correlator.contains("abc123").await);

        assert_eq!(
            sink.delivered(),
            vec![(
                "generic".to_string(),
                "replies/dev1".to_string(),
                "29.75".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let correlator = AsyncResponseCorrelator::new(Duration::from_secs(300));
        assert!(!correlator.resolve(&event("nope", Some("MjkuNzU="))).await);
    }

    #[tokio::test]
    async fn test_entry_removed_even_without_reply() {
        let correlator = AsyncResponseCorrelator::new(Duration::from_secs(300));
        let sink = Arc::new(RecordingSink::default());
        correlator
            .record_pending(&marker("abc123"), context(CoapVerb::Get, None), weak(&sink))
            .await;

        assert!(!correlator.resolve(&event("abc123", None)).await);
        assert!(correlator.is_empty().await);
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_entry_of_dropped_router_is_discarded() {
        let correlator = AsyncResponseCorrelator::new(Duration::from_secs(300));
        let sink = Arc::new(RecordingSink::default());
        correlator
            .record_pending(&marker("abc123"), context(CoapVerb::Get, None), weak(&sink))
            .await;
        drop(sink);

        assert!(!correlator.resolve(&event("abc123", Some("MjkuNzU="))).await);
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_get_uses_response_topic() {
        let correlator = AsyncResponseCorrelator::new(Duration::from_secs(300));
        let sink = Arc::new(RecordingSink::default());
        correlator
            .record_pending(
                &marker("put1"),
                context(CoapVerb::Put, Some("replies/dev1")),
                weak(&sink),
            )
            .await;

        correlator.resolve(&event("put1", Some("MQ=="))).await;
        assert_eq!(sink.delivered()[0].1, "mbed/domain/endpoints/dev1/3303/0/5700");
    }

    #[tokio::test]
    async fn test_marker_without_id_is_not_recorded() {
        let correlator = AsyncResponseCorrelator::new(Duration::from_secs(300));
        let sink = Arc::new(RecordingSink::default());
        let response = RegistryResponse::new(202, r#"{"async-response-id": 12"#);
        let id = correlator
            .record_pending(&response, context(CoapVerb::Get, None), weak(&sink))
            .await;
        assert!(id.is_none());
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_for_endpoint() {
        let correlator = AsyncResponseCorrelator::new(Duration::from_secs(300));
        let sink = Arc::new(RecordingSink::default());
        correlator
            .record_pending(&marker("a"), context(CoapVerb::Get, None), weak(&sink))
            .await;
        let mut other = context(CoapVerb::Get, None);
        other.endpoint = "dev2".into();
        correlator.record_pending(&marker("b"), other, weak(&sink)).await;

        assert_eq!(correlator.remove_for_endpoint("DEV1").await, 1);
        assert!(!correlator.contains("a").await);
        assert!(correlator.contains("b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_purged() {
        let correlator = AsyncResponseCorrelator::new(Duration::from_secs(300));
        let sink = Arc::new(RecordingSink::default());
        correlator
            .record_pending(&marker("old"), context(CoapVerb::Get, None), weak(&sink))
            .await;

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(correlator.purge_expired().await, 1);
        assert!(!correlator.contains("old").await);
    }
}
