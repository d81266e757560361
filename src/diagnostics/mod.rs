//! Observability sinks for the publish and delivery paths.
//!
//! Sinks receive events after a terminal outcome is known and never feed
//! back into control flow.

mod metrics;
mod trace;

use std::time::Duration;

pub use metrics::ComponentMetrics;
pub use trace::{subscription_attributes, SpanContext, SpanRecorder, SpanStatus, Tracer, TracingTracer};

/// Receives one event per delivery attempt.
///
/// `process_status` is one of `success`, `retry`, `drop`. `status` is empty
/// except when an explicit DROP is recorded as a successful consumption
/// (`process_status = "drop"`, `status = "success"`).
pub trait IngressObserver: Send + Sync {
    fn pubsub_ingress_event(
        &self,
        component: &str,
        process_status: &str,
        status: &str,
        topic: &str,
        elapsed: Duration,
    );
}

/// Receives one event per publish call.
pub trait EgressObserver: Send + Sync {
    fn pubsub_egress_event(&self, component: &str, topic: &str, success: bool, elapsed: Duration);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl IngressObserver for NoopObserver {
    fn pubsub_ingress_event(&self, _: &str, _: &str, _: &str, _: &str, _: Duration) {}
}

impl EgressObserver for NoopObserver {
    fn pubsub_egress_event(&self, _: &str, _: &str, _: bool, _: Duration) {}
}
