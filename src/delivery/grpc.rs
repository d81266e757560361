//! gRPC delivery over the app callback service.
//!
//! The service is declared by hand (no `.proto` file) in `build.rs`; its
//! messages are the prost structs below, in standard protobuf wire format.
//!
//! ## RPCs
//!
//! - `OnTopicEvent` - deliver one event. Input = `TopicEventRequest`,
//!   output = `TopicEventResponse`.
//!
//! ## Reply classification
//!
//! - `SUCCESS` → success, `RETRY` → retry, `DROP` → drop
//! - an enum value outside those three → retry
//! - `Unimplemented` → drop (non-retriable)
//! - any other error status, including connection failures → retry
//! - `data_base64` that does not decode → retry, without calling the app

use std::time::Duration;

use async_trait::async_trait;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tracing::debug;

use super::cloud_event::{
    DATA_CONTENT_TYPE_FIELD, SOURCE_FIELD, SPEC_VERSION_FIELD, TRACE_PARENT_FIELD, TYPE_FIELD,
};
use super::{AppChannel, AppProtocol, AppReply, ChannelResult, SubscribedMessage};
use crate::diagnostics::SpanStatus;

// ---------------------------------------------------------------------------
// Message types (prost, standard protobuf wire format)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct TopicEventRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(string, tag = "3")]
    pub r#type: String,
    #[prost(string, tag = "4")]
    pub spec_version: String,
    #[prost(string, tag = "5")]
    pub data_content_type: String,
    #[prost(string, tag = "6")]
    pub topic: String,
    #[prost(bytes = "vec", tag = "7")]
    pub data: Vec<u8>,
    #[prost(string, tag = "8")]
    pub pubsub_name: String,
    #[prost(string, tag = "9")]
    pub path: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TopicEventResponseStatus {
    Success = 0,
    Retry = 1,
    Drop = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TopicEventResponse {
    #[prost(enumeration = "TopicEventResponseStatus", tag = "1")]
    pub status: i32,
}

// ---------------------------------------------------------------------------
// Generated service trait + server/client
// ---------------------------------------------------------------------------

include!(concat!(env!("OUT_DIR"), "/sidecar.runtime.v1.AppCallback.rs"));

pub use app_callback_client::AppCallbackClient;
pub use app_callback_server::{AppCallback, AppCallbackServer};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// [`AppChannel`] that calls `OnTopicEvent` on the app.
#[derive(Debug, Clone)]
pub struct GrpcChannel {
    client: AppCallbackClient<Channel>,
}

impl GrpcChannel {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: AppCallbackClient::new(channel),
        }
    }

    /// Connect eagerly to `endpoint` (e.g. `http://127.0.0.1:50001`).
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(endpoint.into())?.connect().await?;
        Ok(Self::new(channel))
    }

    /// A channel that connects on first use; unreachable apps surface as
    /// `Unavailable` on delivery.
    pub fn lazy(endpoint: impl Into<String>, timeout: Option<Duration>) -> Result<Self, tonic::transport::Error> {
        let mut endpoint = Endpoint::from_shared(endpoint.into())?;
        if let Some(timeout) = timeout {
            endpoint = endpoint.timeout(timeout);
        }
        Ok(Self::new(endpoint.connect_lazy()))
    }
}

#[async_trait]
impl AppChannel for GrpcChannel {
    fn protocol(&self) -> AppProtocol {
        AppProtocol::Grpc
    }

    async fn invoke(&self, message: &SubscribedMessage, traceparent: Option<&str>) -> ChannelResult {
        let event_id = message.cloud_event.id();
        let envelope = match envelope_from_message(message) {
            Ok(envelope) => envelope,
            Err(err) => {
                return ChannelResult {
                    span_status: SpanStatus::Error(err.to_string()),
                    reply: AppReply::retry_with(
                        format!("error decoding data of pub/sub event {}", event_id),
                        err,
                    ),
                }
            }
        };

        let mut request = Request::new(envelope);
        for (key, value) in &message.metadata {
            let key = key.to_ascii_lowercase();
            if key == "content-type" || key.starts_with("grpc-") {
                continue;
            }
            match (
                key.parse::<AsciiMetadataKey>(),
                value.parse::<AsciiMetadataValue>(),
            ) {
                (Ok(key), Ok(value)) => {
                    request.metadata_mut().insert(key, value);
                }
                _ => debug!(metadata = %key, "skipping metadata that is not valid gRPC metadata"),
            }
        }
        if let Some(traceparent) = traceparent {
            if let Ok(value) = traceparent.parse::<AsciiMetadataValue>() {
                request.metadata_mut().insert(TRACE_PARENT_FIELD, value);
            }
        }

        let mut client = self.client.clone();
        match client.on_topic_event(request).await {
            Ok(response) => ChannelResult {
                reply: classify_grpc_status(event_id, response.into_inner().status),
                span_status: SpanStatus::from_grpc_code(None),
            },
            Err(status) => ChannelResult {
                span_status: SpanStatus::from_grpc_code(Some(status.code())),
                reply: classify_grpc_error(event_id, status),
            },
        }
    }
}

/// Build the gRPC envelope; fails only when `data_base64` does not decode.
pub fn envelope_from_message(message: &SubscribedMessage) -> Result<TopicEventRequest, base64::DecodeError> {
    let event = &message.cloud_event;
    let field = |name: &str| event.get_str(name).unwrap_or_default().to_string();
    Ok(TopicEventRequest {
        id: event.id().to_string(),
        source: field(SOURCE_FIELD),
        r#type: field(TYPE_FIELD),
        spec_version: field(SPEC_VERSION_FIELD),
        data_content_type: field(DATA_CONTENT_TYPE_FIELD),
        topic: message.topic.clone(),
        data: event.data_bytes()?,
        pubsub_name: message.pubsub.clone(),
        path: message.path.clone(),
    })
}

/// Classify the status enum of a successful `OnTopicEvent` call.
pub fn classify_grpc_status(event_id: &str, status: i32) -> AppReply {
    match TopicEventResponseStatus::try_from(status) {
        Ok(TopicEventResponseStatus::Success) => AppReply::Success,
        Ok(TopicEventResponseStatus::Retry) => AppReply::retry(format!(
            "RETRY status returned from app while processing pub/sub event {}",
            event_id
        )),
        Ok(TopicEventResponseStatus::Drop) => AppReply::Drop,
        Err(_) => AppReply::retry(format!(
            "unknown status returned from app while processing pub/sub event {}: {}",
            event_id, status
        )),
    }
}

/// Classify a failed `OnTopicEvent` call.
pub fn classify_grpc_error(event_id: &str, status: Status) -> AppReply {
    if status.code() == Code::Unimplemented {
        return AppReply::NonRetriable(format!(
            "non-retriable error returned from app while processing pub/sub event {}: {}",
            event_id,
            status.message()
        ));
    }
    AppReply::retry_with(
        format!("error returned from app while processing pub/sub event {}", event_id),
        status,
    )
}
