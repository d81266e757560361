//! W3C trace context and the span sink used around app deliveries.

use rand::RngCore;
use tracing::field;

/// A W3C trace context (`traceparent` header value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub flags: u8,
}

impl SpanContext {
    /// A new root context with random ids, sampled.
    pub fn root() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace_id = [0u8; 16];
        let mut span_id = [0u8; 8];
        rng.fill_bytes(&mut trace_id);
        rng.fill_bytes(&mut span_id);
        Self {
            trace_id,
            span_id,
            flags: 0x01,
        }
    }

    /// Parse `version-traceid-spanid-flags`. Only version `00` is accepted;
    /// all-zero trace or span ids are invalid.
    pub fn from_w3c(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace = parts.next()?;
        let span = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != "00" {
            return None;
        }

        let mut trace_id = [0u8; 16];
        let mut span_id = [0u8; 8];
        let mut flag_byte = [0u8; 1];
        hex::decode_to_slice(trace, &mut trace_id).ok()?;
        hex::decode_to_slice(span, &mut span_id).ok()?;
        hex::decode_to_slice(flags, &mut flag_byte).ok()?;

        if trace_id == [0u8; 16] || span_id == [0u8; 8] {
            return None;
        }
        Some(Self {
            trace_id,
            span_id,
            flags: flag_byte[0],
        })
    }

    pub fn to_w3c(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            hex::encode(self.trace_id),
            hex::encode(self.span_id),
            self.flags
        )
    }

    /// Same trace, fresh span id.
    pub fn child(&self) -> Self {
        let mut span_id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut span_id);
        Self {
            span_id,
            ..*self
        }
    }

    pub fn trace_id_hex(&self) -> String {
        hex::encode(self.trace_id)
    }

    pub fn span_id_hex(&self) -> String {
        hex::encode(self.span_id)
    }
}

/// Final status recorded on a delivery span.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error(String),
}

impl SpanStatus {
    /// 1xx–3xx are OK; 4xx and 5xx are errors.
    pub fn from_http_status(code: u16) -> Self {
        if (100..400).contains(&code) {
            SpanStatus::Ok
        } else {
            SpanStatus::Error(format!("HTTP status code {}", code))
        }
    }

    /// `None` means the RPC completed without a transport error.
    pub fn from_grpc_code(code: Option<tonic::Code>) -> Self {
        match code {
            None | Some(tonic::Code::Ok) => SpanStatus::Ok,
            Some(code) => SpanStatus::Error(format!("gRPC status {:?}", code)),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            SpanStatus::Unset => "unset",
            SpanStatus::Ok => "ok",
            SpanStatus::Error(_) => "error",
        }
    }
}

/// Span attributes for a subscription delivery on `topic`.
pub fn subscription_attributes(topic: &str) -> Vec<(&'static str, String)> {
    vec![
        ("messaging.system", "pubsub".to_string()),
        ("messaging.destination", topic.to_string()),
        ("messaging.destination_kind", "topic".to_string()),
    ]
}

/// An open span. Must be ended exactly once.
pub trait SpanRecorder: Send {
    /// The context to propagate to the app (this span as parent).
    fn context(&self) -> SpanContext;
    fn add_attributes(&mut self, attributes: &[(&'static str, String)]);
    fn set_status(&mut self, status: SpanStatus);
    fn end(self: Box<Self>);
}

/// Starts spans; the tracing backend behind it is pluggable.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str, parent: SpanContext) -> Box<dyn SpanRecorder>;
}

/// Tracer that records spans into the `tracing` ecosystem.
///
/// The W3C ids are kept as span fields so a subscriber (or an OpenTelemetry
/// layer) can stitch the delivery into the caller's trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(&self, name: &str, parent: SpanContext) -> Box<dyn SpanRecorder> {
        let context = parent.child();
        let span = tracing::info_span!(
            "pubsub.deliver",
            otel.name = name,
            trace_id = %context.trace_id_hex(),
            span_id = %context.span_id_hex(),
            parent_span_id = %parent.span_id_hex(),
            messaging.system = field::Empty,
            messaging.destination = field::Empty,
            messaging.destination_kind = field::Empty,
            otel.status_code = field::Empty,
            otel.status_description = field::Empty,
        );
        Box::new(TracingSpan { span, context })
    }
}

struct TracingSpan {
    span: tracing::Span,
    context: SpanContext,
}

impl SpanRecorder for TracingSpan {
    fn context(&self) -> SpanContext {
        self.context
    }

    fn add_attributes(&mut self, attributes: &[(&'static str, String)]) {
        for (key, value) in attributes {
            // Undeclared keys are ignored by `tracing`.
            self.span.record(*key, value.as_str());
        }
    }

    fn set_status(&mut self, status: SpanStatus) {
        self.span.record("otel.status_code", status.code());
        if let SpanStatus::Error(description) = &status {
            self.span.record("otel.status_description", description.as_str());
        }
    }

    fn end(self: Box<Self>) {
        drop(self.span);
    }
}
