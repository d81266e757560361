//! Publish adapter: the sidecar's outbound path to backend components.
//!
//! ```text
//! publish(request)
//!   │
//!   ├─ registry lookup ────────── NotFound
//!   ├─ empty topic ────────────── InvalidRequest
//!   ├─ scoping check ──────────── NotAllowed
//!   ├─ namespace qualification
//!   └─ runner.run(outbound policy, component.publish)
//!        └─ egress event
//! ```
//!
//! Validation failures never reach the backend. Backend and policy errors
//! are returned unmodified; retries belong to the [`ResiliencyRunner`].

mod bulk;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::access::qualify_topic;
use crate::component::{
    BulkPublishRequest, BulkPublishResponse, Feature, PublishRequest,
};
use crate::diagnostics::{EgressObserver, NoopObserver};
use crate::error::PubSubError;
use crate::registry::{ComponentRegistry, PubSubEntry};
use crate::resiliency::{PolicyKey, ResiliencyRunner};

pub use bulk::{normalize_bulk_response, DefaultBulkPublisher};

/// Validates, scopes and forwards publish requests.
pub struct PubSubAdapter<R> {
    app_id: String,
    namespace: String,
    registry: Arc<ComponentRegistry>,
    runner: Arc<R>,
    observer: Arc<dyn EgressObserver>,
}

impl<R: ResiliencyRunner> PubSubAdapter<R> {
    pub fn new(
        app_id: impl Into<String>,
        namespace: impl Into<String>,
        registry: Arc<ComponentRegistry>,
        runner: Arc<R>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            namespace: namespace.into(),
            registry,
            runner,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Publish one message.
    pub async fn publish(&self, mut request: PublishRequest) -> Result<(), PubSubError> {
        let entry = self.authorize(&request.pubsub_name, &request.topic)?;
        request.topic = qualify_topic(&self.namespace, &request.topic, entry.namespace_scoped);

        let key = PolicyKey::outbound(&entry.name);
        let start = Instant::now();
        let attempt: std::pin::Pin<Box<dyn std::future::Future<Output = _> + Send + '_>> =
            Box::pin(self.runner.run(&key, || entry.component.publish(&request)));
        let result = attempt.await;
        self.observer
            .pubsub_egress_event(&entry.name, &request.topic, result.is_ok(), start.elapsed());

        if let Err(err) = &result {
            debug!(pubsub = %entry.name, topic = %request.topic, error = %err, "publish failed");
        }
        result.map_err(PubSubError::from)
    }

    /// Publish a batch to one topic.
    ///
    /// Scoping is checked once for the topic. The response always holds one
    /// status per entry, in request order; `Err` is reserved for failures
    /// that prevent any entry from being attempted.
    pub async fn bulk_publish(
        &self,
        mut request: BulkPublishRequest,
    ) -> Result<BulkPublishResponse, PubSubError> {
        let entry = self.authorize(&request.pubsub_name, &request.topic)?;
        validate_entries(&request)?;
        request.topic = qualify_topic(&self.namespace, &request.topic, entry.namespace_scoped);

        let start = Instant::now();
        let response = if Feature::BulkPublish.is_present(&entry.component.features()) {
            self.native_bulk_publish(&entry, &request).await
        } else {
            DefaultBulkPublisher::new(entry.component.as_ref(), self.runner.as_ref())
                .publish(&entry.name, &request)
                .await
        };
        self.observer.pubsub_egress_event(
            &entry.name,
            &request.topic,
            !response.has_failures(),
            start.elapsed(),
        );
        Ok(response)
    }

    async fn native_bulk_publish(
        &self,
        entry: &PubSubEntry,
        request: &BulkPublishRequest,
    ) -> BulkPublishResponse {
        let key = PolicyKey::outbound(&entry.name);
        match self
            .runner
            .run(&key, || entry.component.bulk_publish(request))
            .await
        {
            Ok(response) => normalize_bulk_response(request, response),
            Err(err) => {
                warn!(
                    pubsub = %entry.name,
                    topic = %request.topic,
                    entries = request.entries.len(),
                    error = %err,
                    "bulk publish failed"
                );
                BulkPublishResponse::all_failed(request, &err.to_string())
            }
        }
    }

    /// Resolve the component and check that this app may publish to `topic`.
    fn authorize(&self, pubsub_name: &str, topic: &str) -> Result<Arc<PubSubEntry>, PubSubError> {
        let entry = self
            .registry
            .get(pubsub_name)
            .ok_or_else(|| PubSubError::NotFound {
                pubsub_name: pubsub_name.to_string(),
            })?;
        if topic.is_empty() {
            return Err(PubSubError::InvalidRequest("topic is empty".to_string()));
        }
        if !entry.scoping.can_publish(topic) {
            return Err(PubSubError::NotAllowed {
                topic: topic.to_string(),
                app_id: self.app_id.clone(),
            });
        }
        Ok(entry)
    }
}

fn validate_entries(request: &BulkPublishRequest) -> Result<(), PubSubError> {
    let mut seen = HashSet::with_capacity(request.entries.len());
    for entry in &request.entries {
        if entry.entry_id.is_empty() {
            return Err(PubSubError::InvalidRequest(
                "bulk entry id is empty".to_string(),
            ));
        }
        if !seen.insert(entry.entry_id.as_str()) {
            return Err(PubSubError::InvalidRequest(format!(
                "duplicate bulk entry id {}",
                entry.entry_id
            )));
        }
    }
    Ok(())
}
