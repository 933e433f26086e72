//! Self-healing webhook validation.
//!
//! The device registry may lose the bridge's webhook or its subscriptions,
//! for example after a registry restart. The validator periodically checks
//! both and repairs whatever is missing.
//!
//! # Cycle
//!
//! 1. Compare the registry's webhook URL with the expected one.
//! 2. If it matches, check every tracked subscription; if any is missing,
//!    replay all of them.
//! 3. If it does not match, reset and reinstall the webhook, then replay all
//!    subscriptions whatever the reinstall outcome.
//!
//! Expired async correlations are purged on every cycle as well.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::api::RegistryApi;
use crate::config::ValidatorConfig;
use crate::error::{BridgeError, Result};
use crate::gateway::WebhookGateway;
use crate::types::Subscription;

/// What a validation cycle found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Webhook and subscriptions were in place
    Healthy,
    /// Webhook was fine, subscriptions were replayed
    SubscriptionsRepaired,
    /// Webhook was reinstalled and subscriptions replayed
    WebhookRepaired,
}

pub struct WebhookValidator {
    gateway: Arc<WebhookGateway>,
    api: Arc<RegistryApi>,
    config: ValidatorConfig,
}

impl WebhookValidator {
    pub fn new(gateway: Arc<WebhookGateway>, api: Arc<RegistryApi>, config: ValidatorConfig) -> Self {
        Self {
            gateway,
            api,
            config,
        }
    }

    /// Run one validation cycle.
    pub async fn validate(&self) -> ValidationOutcome {
        let purged = self.api.correlator().purge_expired().await;
        if purged > 0 {
            tracing::info!(purged, "expired async requests dropped");
        }

        if self.validate_webhook().await {
            if self.validate_resource_subscriptions().await {
                tracing::debug!("webhook and subscriptions in place");
                return ValidationOutcome::Healthy;
            }
            tracing::warn!("registry lost subscriptions, replaying");
            self.reinitialize_subscriptions().await;
            return ValidationOutcome::SubscriptionsRepaired;
        }

        tracing::warn!(expected = self.gateway.expected_url(), "webhook missing or changed, reinstalling");
        if !self.reinitialize_webhook().await {
            tracing::error!("webhook reinstall failed, will retry next cycle");
        }
        self.reinitialize_subscriptions().await;
        ValidationOutcome::WebhookRepaired
    }

    /// Whether the registry's webhook is the expected URL.
    pub async fn validate_webhook(&self) -> bool {
        self.gateway.registry_url().await.as_deref() == Some(self.gateway.expected_url())
    }

    /// Whether every tracked subscription is still present on the registry.
    pub async fn validate_resource_subscriptions(&self) -> bool {
        for subscription in self.api.subscriptions().snapshot().await {
            if !self
                .api
                .check_subscription(
                    Some(&subscription.domain),
                    &subscription.endpoint,
                    &subscription.resource_path,
                )
                .await
            {
                tracing::info!(%subscription, "subscription missing on registry");
                return false;
            }
        }
        true
    }

    /// Reset then reinstall the webhook. Returns whether the reinstall
    /// succeeded.
    pub async fn reinitialize_webhook(&self) -> bool {
        if !self.gateway.reset().await {
            tracing::warn!("webhook reset failed, installing anyway");
        }
        self.gateway.install(self.gateway.expected_url()).await
    }

    /// Unsubscribe and resubscribe every tracked subscription. Returns how
    /// many were re-established.
    ///
    /// Failures are isolated: a subscription that cannot be restored is
    /// logged and the rest are still processed.
    pub async fn reinitialize_subscriptions(&self) -> usize {
        let subscriptions = self.api.subscriptions().snapshot().await;
        let total = subscriptions.len();
        let mut restored = 0;

        for subscription in &subscriptions {
            if self.resubscribe(subscription).await {
                restored += 1;
            }
        }

        tracing::info!(restored, total, "subscriptions replayed");
        restored
    }

    async fn resubscribe(&self, subscription: &Subscription) -> bool {
        let domain = Some(subscription.domain.as_str());
        let endpoint = &subscription.endpoint;
        let uri = &subscription.resource_path;

        self.api.unsubscribe(domain, endpoint, uri).await;

        let max_attempts = self.config.max_subscription_attempts.max(1);
        for attempt in 1..=max_attempts {
            let Some(response) = self.api.subscribe(domain, endpoint, uri).await else {
                return false;
            };

            if response.is_success() {
                return true;
            }
            if !response.is_endpoint_unavailable() {
                tracing::warn!(%subscription, status = response.status, "resubscribe rejected");
                return false;
            }

            tracing::debug!(%subscription, attempt, max_attempts, "endpoint in queue mode, retrying");
            if attempt < max_attempts {
                tokio::time::sleep(self.config.subscription_retry_delay()).await;
            }
        }

        tracing::warn!(%subscription, max_attempts, "endpoint unavailable, subscription abandoned");
        false
    }

    /// Start the periodic validation task.
    pub fn start(self: Arc<Self>) -> ValidatorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let period = self.config.interval();
        let background_task = tokio::spawn(self.validation_task(period, shutdown_rx));

        ValidatorHandle {
            background_task: Some(background_task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    async fn validation_task(self: Arc<Self>, period: Duration, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already installed everything.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.validate().await;
                    tracing::debug!(?outcome, "validation cycle complete");
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("validator stopped");
    }
}

/// Handle to a running validator task.
pub struct ValidatorHandle {
    background_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ValidatorHandle {
    /// Stop the validator, waiting up to 5 seconds for the current cycle.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        if let Some(task) = self.background_task.take() {
            match timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(BridgeError::ShutdownError(format!(
                    "Validator task panicked: {e}"
                ))),
                Err(_) => Err(BridgeError::ShutdownError(
                    "Validator task shutdown timed out after 5 seconds".to_string(),
                )),
            }
        } else {
            Ok(())
        }
    }
}
