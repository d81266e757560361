use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use super::{EgressObserver, IngressObserver};

const INGRESS_LABELS: &[&str] = &[
    "app_id",
    "component",
    "namespace",
    "process_status",
    "status",
    "topic",
];
const EGRESS_LABELS: &[&str] = &["app_id", "component", "namespace", "success", "topic"];

/// Prometheus-backed pub/sub component metrics.
///
/// Counter vectors are internally synchronized, so one instance can be
/// shared by every concurrent delivery and publish.
#[derive(Clone)]
pub struct ComponentMetrics {
    app_id: String,
    namespace: String,
    ingress_count: IntCounterVec,
    ingress_latency_ms: HistogramVec,
    egress_count: IntCounterVec,
    egress_latency_ms: HistogramVec,
}

impl ComponentMetrics {
    /// Register the pub/sub metric family against `registry`.
    pub fn new(
        app_id: impl Into<String>,
        namespace: impl Into<String>,
        registry: &Registry,
    ) -> Result<Self, prometheus::Error> {
        let ingress_count = IntCounterVec::new(
            Opts::new(
                "pubsub_ingress_count",
                "The number of incoming messages arriving from the pub/sub component",
            ),
            INGRESS_LABELS,
        )?;
        registry.register(Box::new(ingress_count.clone()))?;

        let ingress_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "pubsub_ingress_latencies_ms",
                "The consuming app event processing latency",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 16)?),
            INGRESS_LABELS,
        )?;
        registry.register(Box::new(ingress_latency_ms.clone()))?;

        let egress_count = IntCounterVec::new(
            Opts::new(
                "pubsub_egress_count",
                "The number of outgoing messages published to the pub/sub component",
            ),
            EGRESS_LABELS,
        )?;
        registry.register(Box::new(egress_count.clone()))?;

        let egress_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "pubsub_egress_latencies_ms",
                "The latency of the response from the pub/sub component",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 16)?),
            EGRESS_LABELS,
        )?;
        registry.register(Box::new(egress_latency_ms.clone()))?;

        Ok(Self {
            app_id: app_id.into(),
            namespace: namespace.into(),
            ingress_count,
            ingress_latency_ms,
            egress_count,
            egress_latency_ms,
        })
    }

    /// Current ingress count for one label combination.
    pub fn ingress_count(&self, component: &str, process_status: &str, status: &str, topic: &str) -> u64 {
        self.ingress_count
            .with_label_values(&[self.app_id.as_str(), component, self.namespace.as_str(), process_status, status, topic])
            .get()
    }

    /// Current egress count for one label combination.
    pub fn egress_count(&self, component: &str, topic: &str, success: bool) -> u64 {
        let success = if success { "true" } else { "false" };
        self.egress_count
            .with_label_values(&[self.app_id.as_str(), component, self.namespace.as_str(), success, topic])
            .get()
    }
}

impl IngressObserver for ComponentMetrics {
    fn pubsub_ingress_event(
        &self,
        component: &str,
        process_status: &str,
        status: &str,
        topic: &str,
        elapsed: Duration,
    ) {
        let labels = [
            self.app_id.as_str(),
            component,
            self.namespace.as_str(),
            process_status,
            status,
            topic,
        ];
        self.ingress_count.with_label_values(&labels).inc();
        if !elapsed.is_zero() {
            self.ingress_latency_ms
                .with_label_values(&labels)
                .observe(elapsed.as_secs_f64() * 1000.0);
        }
    }
}

impl EgressObserver for ComponentMetrics {
    fn pubsub_egress_event(&self, component: &str, topic: &str, success: bool, elapsed: Duration) {
        let success = if success { "true" } else { "false" };
        let labels = [self.app_id.as_str(), component, self.namespace.as_str(), success, topic];
        self.egress_count.with_label_values(&labels).inc();
        if !elapsed.is_zero() {
            self.egress_latency_ms
                .with_label_values(&labels)
                .observe(elapsed.as_secs_f64() * 1000.0);
        }
    }
}
