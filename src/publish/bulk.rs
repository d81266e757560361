use std::collections::HashMap;

use futures::future::join_all;

use crate::component::{
    BulkPublishRequest, BulkPublishResponse, BulkPublishResponseEntry, PubSubComponent,
};
use crate::resiliency::{PolicyKey, ResiliencyRunner};

/// Bulk publish for components without native support.
///
/// Every entry is published on its own, concurrently, each wrapped in the
/// outbound policy. A failing entry never stops the others.
pub struct DefaultBulkPublisher<'a, R> {
    component: &'a dyn PubSubComponent,
    runner: &'a R,
}

impl<'a, R: ResiliencyRunner> DefaultBulkPublisher<'a, R> {
    pub fn new(component: &'a dyn PubSubComponent, runner: &'a R) -> Self {
        Self { component, runner }
    }

    /// One status per entry, in request order.
    pub async fn publish(&self, pubsub_name: &str, request: &BulkPublishRequest) -> BulkPublishResponse {
        let key = PolicyKey::outbound(pubsub_name);
        let attempts = request.entries.iter().map(|entry| {
            let single = request.entry_request(entry);
            let key = &key;
            async move {
                match self.runner.run(key, || self.component.publish(&single)).await {
                    Ok(()) => BulkPublishResponseEntry::success(&entry.entry_id),
                    Err(err) => BulkPublishResponseEntry::failed(&entry.entry_id, err.to_string()),
                }
            }
        });

        BulkPublishResponse {
            statuses: join_all(attempts).await,
        }
    }
}

/// Expand a component's bulk response into one status per request entry.
///
/// Components may report only failures; entries they leave out are
/// successes. Statuses for ids not in the request are discarded.
pub fn normalize_bulk_response(
    request: &BulkPublishRequest,
    response: BulkPublishResponse,
) -> BulkPublishResponse {
    let mut reported: HashMap<String, BulkPublishResponseEntry> = response
        .statuses
        .into_iter()
        .map(|status| (status.entry_id.clone(), status))
        .collect();

    BulkPublishResponse {
        statuses: request
            .entries
            .iter()
            .map(|entry| {
                reported
                    .remove(&entry.entry_id)
                    .unwrap_or_else(|| BulkPublishResponseEntry::success(&entry.entry_id))
            })
            .collect(),
    }
}
