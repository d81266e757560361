//! gRPC delivery against a tonic `AppCallback` server.

use std::sync::Arc;
use std::time::Duration;

use sidecar_pubsub::delivery::grpc::TopicEventResponseStatus;
use sidecar_pubsub::diagnostics::{SpanContext, SpanStatus};
use sidecar_pubsub::{is_retriable, ComponentMetrics, Dispatcher, GrpcChannel, Outcome};
use tokio_util::sync::CancellationToken;
use tonic::Code;

use crate::support::{self, closed_address, message, GrpcApp, GrpcReply, RecordingTracer, PARENT, PUBSUB};

async fn dispatcher_for(app: &GrpcApp) -> (Dispatcher, ComponentMetrics) {
    let endpoint = app.serve().await;
    let metrics = support::metrics();
    let channel = GrpcChannel::connect(endpoint).await.unwrap();
    let dispatcher = Dispatcher::new(Arc::new(channel)).with_observer(Arc::new(metrics.clone()));
    (dispatcher, metrics)
}

#[tokio::test]
async fn success_reply_and_envelope_fields() {
    let app = GrpcApp::replying(GrpcReply::Status(TopicEventResponseStatus::Success as i32));
    let (dispatcher, metrics) = dispatcher_for(&app).await;
    let msg = message("orders", None).with_metadata("x-tenant", "acme");

    let outcome = dispatcher.deliver(&CancellationToken::new(), &msg).await.unwrap();
    assert_eq!(outcome, Outcome::Success);
    assert_eq!(metrics.ingress_count(PUBSUB, "success", "", "orders"), 1);

    let received = app.received();
    assert_eq!(received.len(), 1);
    let event = &received[0];
    assert_eq!(event.request.id, "evt-orders");
    assert_eq!(event.request.topic, "orders");
    assert_eq!(event.request.pubsub_name, PUBSUB);
    assert_eq!(event.request.path, "/orders");
    assert_eq!(event.request.source, "tests");
    assert_eq!(event.request.data_content_type, "application/json");
    assert_eq!(event.request.data, br#"{"order":1}"#.to_vec());
    assert_eq!(event.metadata["x-tenant"], "acme");
}

#[tokio::test]
async fn retry_reply_is_a_retriable_error() {
    let app = GrpcApp::replying(GrpcReply::Status(TopicEventResponseStatus::Retry as i32));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let err = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap_err();
    assert!(is_retriable(&err));
    assert_eq!(metrics.ingress_count(PUBSUB, "retry", "", "orders"), 1);
}

#[tokio::test]
async fn drop_reply_is_consumed() {
    let app = GrpcApp::replying(GrpcReply::Status(TopicEventResponseStatus::Drop as i32));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let outcome = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Drop);
    assert_eq!(metrics.ingress_count(PUBSUB, "drop", "success", "orders"), 1);
}

#[tokio::test]
async fn unknown_enum_value_is_retried() {
    let app = GrpcApp::replying(GrpcReply::Status(42));
    let (dispatcher, _) = dispatcher_for(&app).await;

    let err = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap_err();
    assert!(is_retriable(&err));
}

#[tokio::test]
async fn unimplemented_drops_without_error() {
    let app = GrpcApp::replying(GrpcReply::Fail(Code::Unimplemented));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let outcome = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Drop);
    assert_eq!(metrics.ingress_count(PUBSUB, "drop", "", "orders"), 1);
}

#[tokio::test]
async fn other_error_codes_are_retried() {
    for code in [Code::Internal, Code::Unavailable, Code::NotFound] {
        let app = GrpcApp::replying(GrpcReply::Fail(code));
        let (dispatcher, metrics) = dispatcher_for(&app).await;

        let err = dispatcher
            .deliver(&CancellationToken::new(), &message("orders", None))
            .await
            .unwrap_err();
        assert!(is_retriable(&err), "{code:?} should be retried");
        assert_eq!(metrics.ingress_count(PUBSUB, "retry", "", "orders"), 1);
    }
}

#[tokio::test]
async fn unreachable_app_is_retried() {
    let channel = GrpcChannel::lazy(closed_address().await, Some(Duration::from_secs(5))).unwrap();
    let dispatcher = Dispatcher::new(Arc::new(channel));

    let err = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap_err();
    assert!(is_retriable(&err));
}

#[tokio::test]
async fn undecodable_payload_is_retried_without_sending() {
    let app = GrpcApp::replying(GrpcReply::Status(0));
    let (dispatcher, metrics) = dispatcher_for(&app).await;
    let mut msg = message("orders", None);
    msg.cloud_event.set("data_base64", "@@not-base64@@");

    let err = dispatcher.deliver(&CancellationToken::new(), &msg).await.unwrap_err();
    assert!(is_retriable(&err));
    assert!(app.received().is_empty());
    assert_eq!(metrics.ingress_count(PUBSUB, "retry", "", "orders"), 1);
    assert_eq!(metrics.ingress_count(PUBSUB, "drop", "", "orders"), 0);
}

#[tokio::test]
async fn traceparent_is_sent_as_metadata() {
    let app = GrpcApp::replying(GrpcReply::Fail(Code::Unimplemented));
    let endpoint = app.serve().await;
    let tracer = RecordingTracer::default();
    let dispatcher = Dispatcher::new(Arc::new(GrpcChannel::connect(endpoint).await.unwrap()))
        .with_tracer(Arc::new(tracer.clone()));

    dispatcher
        .deliver(&CancellationToken::new(), &message("orders", Some(PARENT)))
        .await
        .unwrap();

    let spans = tracer.spans();
    assert_eq!(spans.len(), 1);
    assert!(matches!(spans[0].status, SpanStatus::Error(_)));
    assert_eq!(spans[0].attribute("messaging.destination_kind"), Some("topic"));

    let received = app.received();
    let forwarded = SpanContext::from_w3c(&received[0].metadata["traceparent"]).unwrap();
    assert_eq!(forwarded, spans[0].context);
}
