//! HTTP delivery: POST the envelope to the app route.
//!
//! ## Reply classification
//!
//! | App reply                          | Result                       |
//! |------------------------------------|------------------------------|
//! | 2xx, empty or unparsable body      | success                      |
//! | 2xx, `status` = `""` / `SUCCESS`   | success                      |
//! | 2xx, `status` = `RETRY`            | retry                        |
//! | 2xx, `status` = `DROP`             | drop                         |
//! | 2xx, any other `status`            | retry                        |
//! | 404                                | drop (non-retriable)         |
//! | any other status / transport error | retry                        |
//!
//! A 2xx body the sidecar cannot parse still counts as processed, while an
//! unknown `status` value in a parsable body is retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use tracing::debug;

use super::cloud_event::{CLOUD_EVENT_CONTENT_TYPE, TRACE_PARENT_FIELD};
use super::{AppChannel, AppProtocol, AppReply, ChannelResult, SubscribedMessage};
use crate::diagnostics::SpanStatus;

/// Body an app may return from a subscription route.
#[derive(Debug, Default, Deserialize)]
struct AppResponse {
    #[serde(default)]
    status: String,
}

/// [`AppChannel`] that POSTs envelopes to `{base_url}/{path}`.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChannel {
    /// `timeout` bounds each request end to end.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self::with_client(builder.build()?, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, message: &SubscribedMessage, traceparent: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.url_for(&message.path))
            .header(CONTENT_TYPE, CLOUD_EVENT_CONTENT_TYPE)
            .body(message.data.clone());

        for (key, value) in &message.metadata {
            if key.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                continue;
            }
            match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => request = request.header(name, value),
                _ => debug!(header = %key, "skipping metadata that is not a valid HTTP header"),
            }
        }
        if let Some(traceparent) = traceparent {
            request = request.header(TRACE_PARENT_FIELD, traceparent);
        }
        request
    }
}

#[async_trait]
impl AppChannel for HttpChannel {
    fn protocol(&self) -> AppProtocol {
        AppProtocol::Http
    }

    async fn invoke(&self, message: &SubscribedMessage, traceparent: Option<&str>) -> ChannelResult {
        let event_id = message.cloud_event.id();
        let response = match self.request(message, traceparent).send().await {
            Ok(response) => response,
            Err(err) => {
                return ChannelResult {
                    span_status: SpanStatus::Error(err.to_string()),
                    reply: AppReply::retry_with(
                        format!("error sending pub/sub event {} to app", event_id),
                        err,
                    ),
                }
            }
        };

        let status = response.status().as_u16();
        let span_status = SpanStatus::from_http_status(status);
        let reply = match response.bytes().await {
            Ok(body) => classify_http_reply(event_id, &message.topic, status, &body),
            Err(err) => AppReply::retry_with(
                format!("error reading app response for pub/sub event {}", event_id),
                err,
            ),
        };
        ChannelResult { reply, span_status }
    }
}

/// Classify an app's HTTP reply to a delivery.
pub fn classify_http_reply(event_id: &str, topic: &str, status: u16, body: &[u8]) -> AppReply {
    if (200..300).contains(&status) {
        let app_response = match serde_json::from_slice::<AppResponse>(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(event_id, error = %err, "app response body not parsable; assuming success");
                AppResponse::default()
            }
        };
        return match app_response.status.as_str() {
            "" | "SUCCESS" => AppReply::Success,
            "RETRY" => AppReply::retry(format!(
                "RETRY status returned from app while processing pub/sub event {}",
                event_id
            )),
            "DROP" => AppReply::Drop,
            _ => AppReply::retry(format!(
                "unknown status returned from app while processing pub/sub event {}: {}",
                event_id, app_response.status
            )),
        };
    }

    let body = String::from_utf8_lossy(body);
    if status == 404 {
        return AppReply::NonRetriable(format!(
            "non-retriable error returned from app while processing pub/sub event {}: {}. status code returned: {}",
            event_id, body, status
        ));
    }
    AppReply::retry(format!(
        "retriable error returned from app while processing pub/sub event {}, topic: {}, body: {}. status code returned: {}",
        event_id, topic, body, status
    ))
}
