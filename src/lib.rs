pub mod access;
pub mod component;
pub mod config;
pub mod delivery;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod publish;
pub mod registry;
pub mod resiliency;
pub mod runtime;

pub use access::ScopingRule;
pub use component::{
    BulkMessageEntry, BulkPublishRequest, BulkPublishResponse, BulkPublishResponseEntry,
    BulkPublishStatus, Feature, InMemoryPubSub, MessageHandler, PubSubComponent, PublishRequest,
};
pub use config::{ConfigError, SidecarConfig};
pub use delivery::{
    AppChannel, AppProtocol, CloudEvent, Dispatcher, GrpcChannel, HttpChannel, Outcome,
    SubscribedMessage, SubscriptionHandler,
};
pub use diagnostics::ComponentMetrics;
pub use error::{is_retriable, ComponentError, DeliveryError, PubSubError, Retriable, Transient};
pub use publish::PubSubAdapter;
pub use registry::{ComponentRegistry, PubSubEntry};
pub use resiliency::{NoopRunner, PolicyKey, PolicyRunner, ResiliencyConfig, ResiliencyRunner};
pub use runtime::{PubSubRuntime, RuntimeError};
