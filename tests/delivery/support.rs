//! Test apps, a recording tracer, and message builders.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Router;
use parking_lot::Mutex;
use prometheus::Registry;
use sidecar_pubsub::delivery::cloud_event::TRACE_PARENT_FIELD;
use sidecar_pubsub::delivery::grpc::{
    AppCallback, AppCallbackServer, TopicEventRequest, TopicEventResponse,
};
use sidecar_pubsub::diagnostics::{SpanContext, SpanRecorder, SpanStatus, Tracer};
use sidecar_pubsub::{CloudEvent, ComponentMetrics, SubscribedMessage};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::metadata::KeyAndValueRef;
use tonic::{Code, Request, Response, Status};

pub const PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
pub const PUBSUB: &str = "pubsub";

pub fn message(topic: &str, traceparent: Option<&str>) -> SubscribedMessage {
    let mut event = CloudEvent::wrap(
        format!("evt-{topic}"),
        "tests",
        PUBSUB,
        topic,
        "application/json",
        br#"{"order":1}"#,
    );
    if let Some(traceparent) = traceparent {
        event.set(TRACE_PARENT_FIELD, traceparent);
    }
    SubscribedMessage::new(PUBSUB, topic, format!("/{topic}"), event)
}

pub fn metrics() -> ComponentMetrics {
    ComponentMetrics::new("app", "", &Registry::new()).unwrap()
}

// ---------------------------------------------------------------------------
// HTTP app
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    pub fn ok(body: &str) -> Self {
        Self::new(200, body)
    }
}

#[derive(Debug, Clone)]
pub struct Received {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct HttpAppState {
    queue: VecDeque<Reply>,
    by_path: HashMap<String, Reply>,
    received: Vec<Received>,
}

/// App that replays scripted replies and records every request.
///
/// Queued replies are consumed in order; the last one repeats.
#[derive(Clone, Default)]
pub struct HttpApp {
    state: Arc<Mutex<HttpAppState>>,
}

impl HttpApp {
    pub fn replying(reply: Reply) -> Self {
        Self::default().then(reply)
    }

    pub fn then(self, reply: Reply) -> Self {
        self.state.lock().queue.push_back(reply);
        self
    }

    pub fn on_path(self, path: &str, reply: Reply) -> Self {
        self.state.lock().by_path.insert(path.to_string(), reply);
        self
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.lock().received.clone()
    }

    /// Bind to port 0 and return the base URL.
    pub async fn serve(&self) -> String {
        let app = Router::new().fallback(handle).with_state(self.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn next_reply(&self, path: &str) -> Reply {
        let mut state = self.state.lock();
        if let Some(reply) = state.by_path.get(path) {
            return reply.clone();
        }
        if state.queue.len() > 1 {
            return state.queue.pop_front().unwrap();
        }
        state.queue.front().cloned().unwrap_or_else(|| Reply::ok(""))
    }
}

async fn handle(
    State(app): State<HttpApp>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let path = uri.path().to_string();
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    app.state.lock().received.push(Received {
        path: path.clone(),
        headers,
        body: body.to_vec(),
    });

    let reply = app.next_reply(&path);
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, reply.body)
}

/// An address nothing listens on.
pub async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// gRPC app
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum GrpcReply {
    Status(i32),
    Fail(Code),
    Stall,
}

#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub request: TopicEventRequest,
    pub metadata: HashMap<String, String>,
}

struct CallbackState {
    reply: GrpcReply,
    received: Vec<ReceivedEvent>,
}

#[derive(Clone)]
pub struct GrpcApp {
    state: Arc<Mutex<CallbackState>>,
}

impl GrpcApp {
    pub fn replying(reply: GrpcReply) -> Self {
        Self {
            state: Arc::new(Mutex::new(CallbackState {
                reply,
                received: Vec::new(),
            })),
        }
    }

    pub fn received(&self) -> Vec<ReceivedEvent> {
        self.state.lock().received.clone()
    }

    /// Bind to port 0, spawn the gRPC server, and return its endpoint.
    pub async fn serve(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = AppCallbackServer::new(self.clone());
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }
}

#[tonic::async_trait]
impl AppCallback for GrpcApp {
    async fn on_topic_event(
        &self,
        request: Request<TopicEventRequest>,
    ) -> Result<Response<TopicEventResponse>, Status> {
        let metadata = request
            .metadata()
            .iter()
            .filter_map(|kv| match kv {
                KeyAndValueRef::Ascii(key, value) => value
                    .to_str()
                    .ok()
                    .map(|v| (key.as_str().to_string(), v.to_string())),
                KeyAndValueRef::Binary(..) => None,
            })
            .collect();

        let reply = {
            let mut state = self.state.lock();
            state.received.push(ReceivedEvent {
                request: request.into_inner(),
                metadata,
            });
            state.reply.clone()
        };

        match reply {
            GrpcReply::Status(status) => Ok(Response::new(TopicEventResponse { status })),
            GrpcReply::Fail(code) => Err(Status::new(code, "scripted failure")),
            GrpcReply::Stall => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: String,
    pub parent: SpanContext,
    pub context: SpanContext,
    pub attributes: Vec<(&'static str, String)>,
    pub status: SpanStatus,
}

impl RecordedSpan {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Keeps every ended span.
#[derive(Clone, Default)]
pub struct RecordingTracer {
    ended: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingTracer {
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.ended.lock().clone()
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &str, parent: SpanContext) -> Box<dyn SpanRecorder> {
        Box::new(OpenSpan {
            sink: Arc::clone(&self.ended),
            span: RecordedSpan {
                name: name.to_string(),
                parent,
                context: parent.child(),
                attributes: Vec::new(),
                status: SpanStatus::Unset,
            },
        })
    }
}

struct OpenSpan {
    sink: Arc<Mutex<Vec<RecordedSpan>>>,
    span: RecordedSpan,
}

impl SpanRecorder for OpenSpan {
    fn context(&self) -> SpanContext {
        self.span.context
    }

    fn add_attributes(&mut self, attributes: &[(&'static str, String)]) {
        self.span.attributes.extend_from_slice(attributes);
    }

    fn set_status(&mut self, status: SpanStatus) {
        self.span.status = status;
    }

    fn end(self: Box<Self>) {
        self.sink.lock().push(self.span);
    }
}
