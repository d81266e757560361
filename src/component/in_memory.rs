//! In-memory pub/sub component for tests and single-process use.
//!
//! Every published message is kept in an append-only log and pushed
//! straight to the handlers subscribed to its topic. A handler that asks
//! for redelivery gets the message again, up to a bounded number of
//! attempts.
//!
//! ## Example
//!
//! ```
//! use sidecar_pubsub::component::{InMemoryPubSub, PubSubComponent, PublishRequest};
//!
//! # tokio_test_block(async {
//! let pubsub = InMemoryPubSub::new("memory");
//! pubsub.publish(&PublishRequest::new("memory", "orders", br#"{"id":1}"#.to_vec())).await.unwrap();
//! assert_eq!(pubsub.published().len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    BulkPublishRequest, BulkPublishResponse, BulkPublishResponseEntry, Feature, MessageHandler,
    PubSubComponent, PublishRequest,
};
use crate::delivery::cloud_event::{CloudEvent, CLOUD_EVENT_CONTENT_TYPE, TRACE_PARENT_FIELD};
use crate::delivery::SubscribedMessage;
use crate::error::ComponentError;

const SOURCE: &str = "in-memory";
const DEFAULT_CONTENT_TYPE: &str = "application/json";
const DEFAULT_MAX_DELIVERIES: u32 = 3;

/// Handler outcomes observed by the component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Messages a handler consumed.
    pub acked: u64,
    /// Messages still failing after the last allowed attempt.
    pub nacked: u64,
    /// Handler invocations, redeliveries included.
    pub attempts: u64,
}

#[derive(Clone)]
struct Subscription {
    topic: String,
    path: String,
    handler: Arc<dyn MessageHandler>,
}

/// In-memory [`PubSubComponent`].
///
/// Cheap to clone; clones share the log and subscriptions.
#[derive(Clone)]
pub struct InMemoryPubSub {
    name: String,
    bulk: bool,
    max_deliveries: u32,
    failing_topics: Arc<RwLock<HashSet<String>>>,
    published: Arc<RwLock<Vec<PublishRequest>>>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    stats: Arc<Mutex<DeliveryStats>>,
}

impl InMemoryPubSub {
    /// Create a component. `name` is used as the pub/sub name on delivered messages.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bulk: false,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            failing_topics: Arc::new(RwLock::new(HashSet::new())),
            published: Arc::new(RwLock::new(Vec::new())),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(Mutex::new(DeliveryStats::default())),
        }
    }

    /// Advertise (and implement) native bulk publish.
    pub fn with_bulk(mut self, enabled: bool) -> Self {
        self.bulk = enabled;
        self
    }

    /// Attempts per message and subscriber before giving up (minimum 1).
    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    /// Make every publish to `topic` fail as unavailable.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.failing_topics.write().insert(topic.into());
    }

    /// Stop failing publishes to `topic`.
    pub fn heal_topic(&self, topic: &str) {
        self.failing_topics.write().remove(topic);
    }

    /// Every request accepted so far, in publish order.
    pub fn published(&self) -> Vec<PublishRequest> {
        self.published.read().clone()
    }

    /// Accepted requests for one topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishRequest> {
        self.published
            .read()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> DeliveryStats {
        *self.stats.lock()
    }

    /// Topics with at least one subscriber.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .read()
            .iter()
            .map(|s| s.topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    fn envelope(&self, request: &PublishRequest) -> CloudEvent {
        let content_type = request.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        if content_type.contains("cloudevents") {
            if let Ok(event) = CloudEvent::from_slice(&request.data) {
                return event;
            }
        }
        let mut event = CloudEvent::wrap(
            Uuid::new_v4().to_string(),
            SOURCE,
            &self.name,
            &request.topic,
            content_type,
            &request.data,
        );
        if let Some(traceparent) = request.metadata.get(TRACE_PARENT_FIELD) {
            event.set(TRACE_PARENT_FIELD, traceparent.as_str());
        }
        event
    }

    async fn fan_out(&self, request: &PublishRequest) {
        // Handlers run outside the lock.
        let targets: Vec<Subscription> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.topic == request.topic)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }

        let event = self.envelope(request);
        for target in targets {
            let mut message =
                SubscribedMessage::new(&self.name, &request.topic, &target.path, event.clone());
            message.metadata = request.metadata.clone();
            message
                .metadata
                .insert("content-type".to_string(), CLOUD_EVENT_CONTENT_TYPE.to_string());
            self.deliver(&target, message).await;
        }
    }

    async fn deliver(&self, target: &Subscription, message: SubscribedMessage) {
        for attempt in 1..=self.max_deliveries {
            self.stats.lock().attempts += 1;
            match target.handler.handle(message.clone()).await {
                Ok(()) => {
                    self.stats.lock().acked += 1;
                    return;
                }
                Err(err) => {
                    debug!(topic = %target.topic, attempt, error = %err, "handler asked for redelivery");
                }
            }
        }
        warn!(
            topic = %target.topic,
            event_id = message.cloud_event.id(),
            "message not consumed after {} attempts",
            self.max_deliveries
        );
        self.stats.lock().nacked += 1;
    }
}

#[async_trait]
impl PubSubComponent for InMemoryPubSub {
    async fn publish(&self, request: &PublishRequest) -> Result<(), ComponentError> {
        if self.failing_topics.read().contains(&request.topic) {
            return Err(ComponentError::Unavailable(format!(
                "topic {} is failing",
                request.topic
            )));
        }
        self.published.write().push(request.clone());
        self.fan_out(request).await;
        Ok(())
    }

    async fn bulk_publish(
        &self,
        request: &BulkPublishRequest,
    ) -> Result<BulkPublishResponse, ComponentError> {
        if !self.bulk {
            return Err(ComponentError::Unsupported("bulk publish"));
        }
        // Only failures are reported; absent entries were published.
        let mut statuses = Vec::new();
        for entry in &request.entries {
            if let Err(err) = self.publish(&request.entry_request(entry)).await {
                statuses.push(BulkPublishResponseEntry::failed(&entry.entry_id, err.to_string()));
            }
        }
        Ok(BulkPublishResponse { statuses })
    }

    async fn subscribe(
        &self,
        topic: &str,
        path: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ComponentError> {
        self.subscriptions.write().push(Subscription {
            topic: topic.to_string(),
            path: path.to_string(),
            handler,
        });
        Ok(())
    }

    fn features(&self) -> Vec<Feature> {
        if self.bulk {
            vec![Feature::BulkPublish]
        } else {
            Vec::new()
        }
    }
}
