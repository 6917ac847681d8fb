//! HTTP broadcaster: forwards feedback events to a webhook
//!
//! A bus subscriber that POSTs each event as JSON. Delivery is
//! fire-and-forget: the POST runs on its own task so a slow or dead webhook
//! never slows the bus, and after the retry budget the event is dropped with
//! a log line.

use crate::config::WebhookConfig;
use crate::error::SinkError;
use crate::feedback::{FeedbackBus, FeedbackEvent, FeedbackSubscriber, SubscriptionId};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Feedback subscriber that POSTs events to a configured URL.
pub struct HttpBroadcaster {
    config: WebhookConfig,
    bus: FeedbackBus,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl std::fmt::Debug for HttpBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBroadcaster")
            .field("endpoint", &self.config.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpBroadcaster {
    pub fn new(config: WebhookConfig, bus: FeedbackBus) -> Self {
        Self { config, bus, subscription: Mutex::new(None) }
    }

    /// Subscribe to the bus. Degrades to a logged no-op when no endpoint is
    /// configured or the HTTP client cannot be constructed.
    pub async fn start(&self) {
        if self.subscription.lock().expect("subscription lock poisoned").is_some() {
            return;
        }
        let Some(endpoint) = self.config.endpoint.clone() else {
            tracing::warn!("feedback webhook enabled without an endpoint; broadcaster disabled");
            return;
        };
        let client = match reqwest::Client::builder().timeout(self.config.timeout).build() {
            Ok(client) => client,
            Err(error) => {
                tracing::warn!(%error, "http client unavailable; feedback broadcaster disabled");
                return;
            }
        };

        let delivery = Arc::new(Delivery {
            client,
            endpoint,
            max_retries: self.config.max_retries,
            backoff_base: self.config.backoff_base,
        });
        let id = self.bus.subscribe(Arc::new(WebhookSubscriber { delivery })).await;
        *self.subscription.lock().expect("subscription lock poisoned") = Some(id);
        tracing::info!(endpoint = %self.config.endpoint.as_deref().unwrap_or(""), "feedback webhook started");
    }

    /// Unsubscribe from the bus; in-flight deliveries finish on their own.
    pub async fn stop(&self) {
        let id = self.subscription.lock().expect("subscription lock poisoned").take();
        if let Some(id) = id {
            self.bus.unsubscribe(id).await;
            tracing::info!("feedback webhook stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscription.lock().expect("subscription lock poisoned").is_some()
    }
}

struct WebhookSubscriber {
    delivery: Arc<Delivery>,
}

#[async_trait]
impl FeedbackSubscriber for WebhookSubscriber {
    async fn on_event(&self, event: &FeedbackEvent) -> Result<(), SinkError> {
        let delivery = self.delivery.clone();
        let event = event.clone();
        tokio::spawn(async move { delivery.deliver(event).await });
        Ok(())
    }
}

struct Delivery {
    client: reqwest::Client,
    endpoint: String,
    max_retries: usize,
    backoff_base: Duration,
}

impl Delivery {
    async fn deliver(&self, event: FeedbackEvent) {
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_base * attempt as u32).await;
            }
            match self.client.post(&self.endpoint).json(&event).send().await {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => {
                    tracing::debug!(
                        status = %response.status(),
                        attempt,
                        "feedback webhook rejected event"
                    );
                }
                Err(error) => {
                    tracing::debug!(%error, attempt, "feedback webhook delivery failed");
                }
            }
        }
        tracing::warn!(
            endpoint = %self.endpoint,
            attempts = self.max_retries + 1,
            "feedback event dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;

    #[tokio::test]
    async fn start_without_endpoint_is_noop() {
        let bus = FeedbackBus::new();
        let broadcaster = HttpBroadcaster::new(WebhookConfig::default(), bus.clone());
        broadcaster.start().await;
        assert!(!broadcaster.is_active());
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn start_and_stop_manage_subscription() {
        let bus = FeedbackBus::new();
        let config = WebhookConfig {
            enabled: true,
            endpoint: Some("http://127.0.0.1:9/never".to_string()),
            ..Default::default()
        };
        let broadcaster = HttpBroadcaster::new(config, bus.clone());

        broadcaster.start().await;
        assert!(broadcaster.is_active());
        assert_eq!(bus.subscriber_count().await, 1);

        // Idempotent.
        broadcaster.start().await;
        assert_eq!(bus.subscriber_count().await, 1);

        broadcaster.stop().await;
        assert!(!broadcaster.is_active());
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
