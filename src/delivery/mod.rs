//! Delivery of subscribed messages to the application.
//!
//! A backend component hands the sidecar a [`SubscribedMessage`]; the
//! [`Dispatcher`] pushes it to the app over the configured [`AppChannel`]
//! (HTTP or gRPC) and reduces the app's reply to an [`Outcome`]:
//!
//! ```text
//!            ┌─────────┐
//!  message ─▶│  Sent   │──┬──▶ Success  (Ok)
//!            └─────────┘  ├──▶ Drop     (Ok, consumed without processing)
//!                         └──▶ Retry    (Err(DeliveryError), redeliver)
//! ```
//!
//! Both channels classify their replies into the same [`AppReply`], so the
//! success/retry/drop policy, logging, and observability live in one place.
//! Each attempt is independent; nothing is carried from one attempt to the
//! next.

pub mod cloud_event;
pub mod grpc;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::component::MessageHandler;
use crate::diagnostics::{
    subscription_attributes, IngressObserver, NoopObserver, SpanContext, SpanRecorder, SpanStatus,
    Tracer, TracingTracer,
};
use crate::error::{BoxError, DeliveryError};
use crate::resiliency::{PolicyKey, ResiliencyRunner};

pub use cloud_event::CloudEvent;
pub use grpc::GrpcChannel;
pub use http::HttpChannel;

/// Terminal classification of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Retry,
    Drop,
}

impl Outcome {
    /// Lower-case observability tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retry => "retry",
            Outcome::Drop => "drop",
        }
    }
}

/// Protocol the application declared for receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppProtocol {
    #[default]
    Http,
    Grpc,
}

/// A message a backend component hands over for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribedMessage {
    /// Pub/sub component name.
    pub pubsub: String,
    pub topic: String,
    /// Application route the subscription is bound to.
    pub path: String,
    /// Raw payload forwarded to the app (the serialized envelope).
    pub data: Vec<u8>,
    /// Forwarded to the app as HTTP headers / gRPC metadata.
    pub metadata: HashMap<String, String>,
    pub cloud_event: CloudEvent,
}

impl SubscribedMessage {
    /// A message whose raw payload is the serialized `cloud_event`.
    pub fn new(
        pubsub: impl Into<String>,
        topic: impl Into<String>,
        path: impl Into<String>,
        cloud_event: CloudEvent,
    ) -> Self {
        Self {
            pubsub: pubsub.into(),
            topic: topic.into(),
            path: path.into(),
            data: cloud_event.to_vec(),
            metadata: HashMap::new(),
            cloud_event,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An app reply, reduced to what the outcome policy needs.
#[derive(Debug)]
pub enum AppReply {
    /// Processed.
    Success,
    /// The app explicitly asked to drop the message.
    Drop,
    /// The app cannot handle the route; retrying cannot help.
    NonRetriable(String),
    /// Transient failure or explicit/unknown retry request.
    Retry {
        message: String,
        cause: Option<BoxError>,
    },
}

impl AppReply {
    pub(crate) fn retry(message: impl Into<String>) -> Self {
        AppReply::Retry {
            message: message.into(),
            cause: None,
        }
    }

    pub(crate) fn retry_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        AppReply::Retry {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    /// The outcome this reply resolves to.
    pub fn outcome(&self) -> Outcome {
        match self {
            AppReply::Success => Outcome::Success,
            AppReply::Drop | AppReply::NonRetriable(_) => Outcome::Drop,
            AppReply::Retry { .. } => Outcome::Retry,
        }
    }
}

/// What a channel observed for one send.
#[derive(Debug)]
pub struct ChannelResult {
    pub reply: AppReply,
    pub span_status: SpanStatus,
}

/// A connection to the application for one protocol.
#[async_trait]
pub trait AppChannel: Send + Sync {
    fn protocol(&self) -> AppProtocol;

    /// Send `message` to the app and classify its reply. Never fails:
    /// transport errors are classified too.
    async fn invoke(&self, message: &SubscribedMessage, traceparent: Option<&str>) -> ChannelResult;
}

/// Delivers messages to the app and reduces replies to an [`Outcome`].
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn AppChannel>,
    tracer: Arc<dyn Tracer>,
    observer: Arc<dyn IngressObserver>,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn AppChannel>) -> Self {
        Self {
            channel,
            tracer: Arc::new(TracingTracer),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn IngressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn protocol(&self) -> AppProtocol {
        self.channel.protocol()
    }

    /// Deliver one message.
    ///
    /// `Ok` carries [`Outcome::Success`] or [`Outcome::Drop`]; the message is
    /// consumed either way. `Err` is the [`Outcome::Retry`] case. Cancelling
    /// `cancel` mid-flight resolves the attempt to `Retry`. Dropping the
    /// returned future before it resolves (an outer deadline) still records
    /// a `retry` event.
    pub async fn deliver(
        &self,
        cancel: &CancellationToken,
        message: &SubscribedMessage,
    ) -> Result<Outcome, DeliveryError> {
        let span = message.cloud_event.trace_parent().map(|traceparent| {
            let parent = SpanContext::from_w3c(traceparent).unwrap_or_else(SpanContext::root);
            self.tracer
                .start_span(&format!("pubsub/{}", message.topic), parent)
        });
        let traceparent = span.as_ref().map(|s| s.context().to_w3c());

        let mut attempt = InFlight {
            dispatcher: self,
            message,
            span,
            start: Instant::now(),
            armed: true,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => ChannelResult {
                reply: AppReply::retry("delivery cancelled before the app replied"),
                span_status: SpanStatus::Error("cancelled".to_string()),
            },
            result = self.channel.invoke(message, traceparent.as_deref()) => result,
        };
        let (span, elapsed) = attempt.finish();

        if let Some(mut span) = span {
            span.add_attributes(&subscription_attributes(&message.topic));
            span.set_status(result.span_status);
            span.end();
        }

        self.resolve(message, result.reply, elapsed)
    }

    fn resolve(
        &self,
        message: &SubscribedMessage,
        reply: AppReply,
        elapsed: Duration,
    ) -> Result<Outcome, DeliveryError> {
        let event_id = message.cloud_event.id();
        let outcome = reply.outcome();
        match reply {
            AppReply::Success => {
                self.record(message, Outcome::Success, "", elapsed);
                Ok(outcome)
            }
            AppReply::Drop => {
                warn!(
                    pubsub = %message.pubsub,
                    topic = %message.topic,
                    event_id,
                    "DROP status returned from app while processing pub/sub event"
                );
                self.record(message, Outcome::Drop, Outcome::Success.as_tag(), elapsed);
                Ok(outcome)
            }
            AppReply::NonRetriable(detail) => {
                error!(
                    pubsub = %message.pubsub,
                    topic = %message.topic,
                    event_id,
                    "non-retriable error returned from app while processing pub/sub event: {}",
                    detail
                );
                self.record(message, Outcome::Drop, "", elapsed);
                Ok(outcome)
            }
            AppReply::Retry { message: text, cause } => {
                self.record(message, Outcome::Retry, "", elapsed);
                let err = match cause {
                    Some(cause) => DeliveryError::retriable(text, cause),
                    None => DeliveryError::retry_requested(text),
                };
                debug!(
                    pubsub = %message.pubsub,
                    topic = %message.topic,
                    event_id,
                    error = %err,
                    "pub/sub event will be redelivered"
                );
                Err(err)
            }
        }
    }

    fn record(&self, message: &SubscribedMessage, outcome: Outcome, status: &str, elapsed: Duration) {
        self.observer.pubsub_ingress_event(
            &message.pubsub,
            outcome.as_tag(),
            status,
            &message.topic,
            elapsed,
        );
    }
}

/// An attempt between send and reply. If it is dropped while still armed
/// the attempt was abandoned, which counts as a retry.
struct InFlight<'a> {
    dispatcher: &'a Dispatcher,
    message: &'a SubscribedMessage,
    span: Option<Box<dyn SpanRecorder>>,
    start: Instant,
    armed: bool,
}

impl InFlight<'_> {
    fn finish(&mut self) -> (Option<Box<dyn SpanRecorder>>, Duration) {
        self.armed = false;
        (self.span.take(), self.start.elapsed())
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let message = self.message;
        if let Some(mut span) = self.span.take() {
            span.add_attributes(&subscription_attributes(&message.topic));
            span.set_status(SpanStatus::Error("abandoned".to_string()));
            span.end();
        }
        debug!(
            pubsub = %message.pubsub,
            topic = %message.topic,
            event_id = message.cloud_event.id(),
            "delivery abandoned before the app replied; pub/sub event will be redelivered"
        );
        self.dispatcher
            .record(message, Outcome::Retry, "", self.start.elapsed());
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: SubscribedMessage) -> Result<(), DeliveryError> {
        self.deliver(&CancellationToken::new(), &message).await.map(|_| ())
    }
}

/// A [`MessageHandler`] that delivers through a [`Dispatcher`] under the
/// component's inbound resiliency policy.
///
/// Only `Retry` outcomes are retried by the policy; when the policy gives
/// up, the error goes back to the component for redelivery.
pub struct SubscriptionHandler<R> {
    dispatcher: Dispatcher,
    runner: Arc<R>,
    cancel: CancellationToken,
}

impl<R: ResiliencyRunner> SubscriptionHandler<R> {
    pub fn new(dispatcher: Dispatcher, runner: Arc<R>, cancel: CancellationToken) -> Self {
        Self {
            dispatcher,
            runner,
            cancel,
        }
    }
}

#[async_trait]
impl<R: ResiliencyRunner + 'static> MessageHandler for SubscriptionHandler<R> {
    async fn handle(&self, message: SubscribedMessage) -> Result<(), DeliveryError> {
        let key = PolicyKey::inbound(&message.pubsub);
        self.runner
            .run(&key, || self.dispatcher.deliver(&self.cancel, &message))
            .await
            .map(|_| ())
    }
}
