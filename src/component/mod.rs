//! Backend component contract.
//!
//! A backend component is a pluggable messaging system (queue, broker,
//! stream) registered under a logical pub/sub name. How components are
//! loaded is outside this crate; this module only defines what the
//! publish path and the delivery path need from one.
//!
//! ```text
//! ┌──────────────┐  publish / bulk_publish   ┌──────────────────┐
//! │ PubSubAdapter│ ────────────────────────▶ │ PubSubComponent  │
//! └──────────────┘                           │  (InMemoryPubSub,│
//! ┌──────────────┐  handle(SubscribedMessage)│   Kafka, NATS…)  │
//! │MessageHandler│ ◀──────────────────────── │                  │
//! └──────────────┘                           └──────────────────┘
//! ```

mod in_memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::delivery::SubscribedMessage;
use crate::error::{ComponentError, DeliveryError};

pub use in_memory::{DeliveryStats, InMemoryPubSub};

/// Capability tags a component may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// The component publishes a batch natively.
    BulkPublish,
}

impl Feature {
    /// Is this feature in the advertised set?
    pub fn is_present(self, features: &[Feature]) -> bool {
        features.contains(&self)
    }
}

/// A single outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub pubsub_name: String,
    pub topic: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl PublishRequest {
    pub fn new(pubsub_name: impl Into<String>, topic: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            pubsub_name: pubsub_name.into(),
            topic: topic.into(),
            data: data.into(),
            content_type: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One entry of a bulk publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkMessageEntry {
    pub entry_id: String,
    pub event: Vec<u8>,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

impl BulkMessageEntry {
    pub fn new(entry_id: impl Into<String>, event: impl Into<Vec<u8>>) -> Self {
        Self {
            entry_id: entry_id.into(),
            event: event.into(),
            content_type: "application/json".to_string(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A batch of messages for one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkPublishRequest {
    pub pubsub_name: String,
    pub topic: String,
    pub entries: Vec<BulkMessageEntry>,
    /// Request-level metadata; entry metadata overrides it key by key.
    pub metadata: HashMap<String, String>,
}

impl BulkPublishRequest {
    pub fn new(pubsub_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            pubsub_name: pubsub_name.into(),
            topic: topic.into(),
            entries: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, entry: BulkMessageEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The single-message request equivalent to `entry`.
    pub fn entry_request(&self, entry: &BulkMessageEntry) -> PublishRequest {
        let mut metadata = self.metadata.clone();
        metadata.extend(entry.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        PublishRequest {
            pubsub_name: self.pubsub_name.clone(),
            topic: self.topic.clone(),
            data: entry.event.clone(),
            content_type: Some(entry.content_type.clone()),
            metadata,
        }
    }
}

/// Per-entry result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkPublishStatus {
    Success,
    Failed,
}

/// Result of one bulk entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPublishResponseEntry {
    pub entry_id: String,
    pub status: BulkPublishStatus,
    pub error: Option<String>,
}

impl BulkPublishResponseEntry {
    pub fn success(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            status: BulkPublishStatus::Success,
            error: None,
        }
    }

    pub fn failed(entry_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            status: BulkPublishStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BulkPublishStatus::Success
    }
}

/// Per-entry outcome of a bulk publish, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkPublishResponse {
    pub statuses: Vec<BulkPublishResponseEntry>,
}

impl BulkPublishResponse {
    /// Every entry of `request` failed with the same error.
    pub fn all_failed(request: &BulkPublishRequest, error: &str) -> Self {
        Self {
            statuses: request
                .entries
                .iter()
                .map(|e| BulkPublishResponseEntry::failed(&e.entry_id, error))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn failed_entries(&self) -> impl Iterator<Item = &BulkPublishResponseEntry> {
        self.statuses.iter().filter(|s| !s.is_success())
    }

    pub fn has_failures(&self) -> bool {
        self.failed_entries().next().is_some()
    }

    pub fn status_of(&self, entry_id: &str) -> Option<&BulkPublishResponseEntry> {
        self.statuses.iter().find(|s| s.entry_id == entry_id)
    }
}

/// Receives messages a component pushes for delivery to the app.
///
/// `Ok` means the message is consumed (acknowledge); `Err` asks the
/// component to redeliver.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: SubscribedMessage) -> Result<(), DeliveryError>;
}

/// A messaging backend.
///
/// Implementations might include:
/// - `InMemoryPubSub` - for tests and single-process use
/// - Kafka, NATS, RabbitMQ or cloud queue adapters (external)
#[async_trait]
pub trait PubSubComponent: Send + Sync {
    /// Publish a single message.
    async fn publish(&self, request: &PublishRequest) -> Result<(), ComponentError>;

    /// Publish a batch natively. Only called when [`Feature::BulkPublish`]
    /// is advertised.
    ///
    /// The response may list only failed entries; entries absent from it
    /// are treated as published.
    async fn bulk_publish(
        &self,
        _request: &BulkPublishRequest,
    ) -> Result<BulkPublishResponse, ComponentError> {
        Err(ComponentError::Unsupported("bulk publish"))
    }

    /// Start pushing messages for `topic` to `handler`, tagged with the app route `path`.
    async fn subscribe(
        &self,
        _topic: &str,
        _path: &str,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ComponentError> {
        Err(ComponentError::Unsupported("subscribe"))
    }

    /// Advertised capabilities.
    fn features(&self) -> Vec<Feature> {
        Vec::new()
    }
}
