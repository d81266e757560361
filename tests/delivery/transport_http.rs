//! HTTP delivery: reply classification, headers, tracing, and metrics.

use std::sync::Arc;
use std::time::Duration;

use sidecar_pubsub::diagnostics::{SpanContext, SpanStatus};
use sidecar_pubsub::{is_retriable, ComponentMetrics, Dispatcher, HttpChannel, Outcome};
use tokio_util::sync::CancellationToken;

use crate::support::{self, closed_address, message, HttpApp, RecordingTracer, Reply, PARENT, PUBSUB};

async fn dispatcher_for(app: &HttpApp) -> (Dispatcher, ComponentMetrics) {
    let base = app.serve().await;
    let metrics = support::metrics();
    let channel = HttpChannel::new(base, Some(Duration::from_secs(5))).unwrap();
    let dispatcher = Dispatcher::new(Arc::new(channel)).with_observer(Arc::new(metrics.clone()));
    (dispatcher, metrics)
}

#[tokio::test]
async fn empty_status_is_success() {
    let app = HttpApp::replying(Reply::ok(r#"{"status":""}"#));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let outcome = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(metrics.ingress_count(PUBSUB, "success", "", "orders"), 1);
}

#[tokio::test]
async fn empty_body_is_success() {
    let app = HttpApp::replying(Reply::ok(""));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let outcome = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(metrics.ingress_count(PUBSUB, "success", "", "orders"), 1);
}

#[tokio::test]
async fn retry_status_is_a_retriable_error() {
    let app = HttpApp::replying(Reply::ok(r#"{"status":"RETRY"}"#));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let err = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap_err();

    assert!(is_retriable(&err));
    assert!(err.message().contains("RETRY"));
    assert_eq!(metrics.ingress_count(PUBSUB, "retry", "", "orders"), 1);
}

#[tokio::test]
async fn drop_status_is_consumed_and_tagged_drop_success() {
    let app = HttpApp::replying(Reply::ok(r#"{"status":"DROP"}"#));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let outcome = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Drop);
    assert_eq!(metrics.ingress_count(PUBSUB, "drop", "success", "orders"), 1);
    assert_eq!(metrics.ingress_count(PUBSUB, "success", "", "orders"), 0);
}

#[tokio::test]
async fn lower_case_drop_is_redelivered() {
    let app = HttpApp::replying(Reply::ok(r#"{"status":"drop"}"#));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let err = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap_err();

    assert!(is_retriable(&err));
    assert_eq!(metrics.ingress_count(PUBSUB, "retry", "", "orders"), 1);
    assert_eq!(metrics.ingress_count(PUBSUB, "drop", "success", "orders"), 0);
}

#[tokio::test]
async fn not_found_drops_without_error() {
    let app = HttpApp::replying(Reply::new(404, "no such route"));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let outcome = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Drop);
    assert_eq!(metrics.ingress_count(PUBSUB, "drop", "", "orders"), 1);
    assert_eq!(metrics.ingress_count(PUBSUB, "drop", "success", "orders"), 0);
}

#[tokio::test]
async fn server_error_is_retried_with_body_and_code() {
    let app = HttpApp::replying(Reply::new(500, "database down"));
    let (dispatcher, metrics) = dispatcher_for(&app).await;

    let err = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap_err();

    assert!(is_retriable(&err));
    assert!(err.message().contains("database down"));
    assert!(err.message().contains("500"));
    assert_eq!(metrics.ingress_count(PUBSUB, "retry", "", "orders"), 1);
}

#[tokio::test]
async fn unknown_status_is_retried() {
    let app = HttpApp::replying(Reply::ok(r#"{"status":"MAYBE"}"#));
    let (dispatcher, _) = dispatcher_for(&app).await;

    let err = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap_err();
    assert!(is_retriable(&err));
}

#[tokio::test]
async fn unreachable_app_is_retried() {
    let metrics = support::metrics();
    let channel = HttpChannel::new(closed_address().await, Some(Duration::from_secs(5))).unwrap();
    let dispatcher = Dispatcher::new(Arc::new(channel)).with_observer(Arc::new(metrics.clone()));

    let err = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap_err();

    assert!(is_retriable(&err));
    assert_eq!(metrics.ingress_count(PUBSUB, "retry", "", "orders"), 1);
}

#[tokio::test]
async fn request_carries_envelope_metadata_and_content_type() {
    let app = HttpApp::replying(Reply::ok(""));
    let (dispatcher, _) = dispatcher_for(&app).await;
    let msg = message("orders", None)
        .with_metadata("x-tenant", "acme")
        .with_metadata("bad header\n", "skipped");

    dispatcher.deliver(&CancellationToken::new(), &msg).await.unwrap();

    let received = app.received();
    assert_eq!(received.len(), 1);
    let request = &received[0];
    assert_eq!(request.path, "/orders");
    assert_eq!(request.body, msg.data);
    assert_eq!(request.headers["content-type"], "application/cloudevents+json");
    assert_eq!(request.headers["x-tenant"], "acme");
    assert!(!request.headers.contains_key("traceparent"));
}

#[tokio::test]
async fn traced_delivery_propagates_child_context() {
    let app = HttpApp::replying(Reply::new(503, "busy"));
    let base = app.serve().await;
    let tracer = RecordingTracer::default();
    let dispatcher = Dispatcher::new(Arc::new(HttpChannel::new(base, None).unwrap()))
        .with_tracer(Arc::new(tracer.clone()));

    let result = dispatcher
        .deliver(&CancellationToken::new(), &message("orders", Some(PARENT)))
        .await;
    assert!(result.is_err());

    let spans = tracer.spans();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.name, "pubsub/orders");
    assert_eq!(span.parent, SpanContext::from_w3c(PARENT).unwrap());
    assert_eq!(span.attribute("messaging.destination"), Some("orders"));
    assert_eq!(span.attribute("messaging.system"), Some("pubsub"));
    assert!(matches!(span.status, SpanStatus::Error(_)));

    let forwarded = &app.received()[0].headers["traceparent"];
    let forwarded = SpanContext::from_w3c(forwarded).unwrap();
    assert_eq!(forwarded, span.context);
    assert_eq!(forwarded.trace_id, span.parent.trace_id);
    assert_ne!(forwarded.span_id, span.parent.span_id);
}

#[tokio::test]
async fn traceid_field_is_a_fallback_parent() {
    let app = HttpApp::replying(Reply::ok(""));
    let base = app.serve().await;
    let tracer = RecordingTracer::default();
    let dispatcher = Dispatcher::new(Arc::new(HttpChannel::new(base, None).unwrap()))
        .with_tracer(Arc::new(tracer.clone()));

    let mut msg = message("orders", None);
    msg.cloud_event.set("traceid", PARENT);
    dispatcher.deliver(&CancellationToken::new(), &msg).await.unwrap();

    let spans = tracer.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, SpanStatus::Ok);
    assert_eq!(spans[0].parent.trace_id_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
}

#[tokio::test]
async fn untraced_delivery_starts_no_span() {
    let app = HttpApp::replying(Reply::ok(""));
    let base = app.serve().await;
    let tracer = RecordingTracer::default();
    let dispatcher = Dispatcher::new(Arc::new(HttpChannel::new(base, None).unwrap()))
        .with_tracer(Arc::new(tracer.clone()));

    dispatcher
        .deliver(&CancellationToken::new(), &message("orders", None))
        .await
        .unwrap();
    assert!(tracer.spans().is_empty());
}

#[tokio::test]
async fn redelivery_is_evaluated_independently() {
    let app = HttpApp::replying(Reply::ok(r#"{"status":"RETRY"}"#)).then(Reply::ok(r#"{"status":"SUCCESS"}"#));
    let (dispatcher, metrics) = dispatcher_for(&app).await;
    let msg = message("orders", None);
    let cancel = CancellationToken::new();

    assert!(dispatcher.deliver(&cancel, &msg).await.is_err());
    assert_eq!(dispatcher.deliver(&cancel, &msg).await.unwrap(), Outcome::Success);

    assert_eq!(metrics.ingress_count(PUBSUB, "retry", "", "orders"), 1);
    assert_eq!(metrics.ingress_count(PUBSUB, "success", "", "orders"), 1);
    let received = app.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].body, received[1].body);
}
