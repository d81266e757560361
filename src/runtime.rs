//! Wires configuration, components, resiliency, and observability into
//! one pub/sub runtime.
//!
//! ## Example
//!
//! ```ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use sidecar_pubsub::{InMemoryPubSub, PubSubRuntime, PublishRequest, SidecarConfig};
//!
//! let config = SidecarConfig::from_path("sidecar.json")?;
//! let mut components = HashMap::new();
//! components.insert("orders".to_string(), Arc::new(InMemoryPubSub::new("orders")) as _);
//!
//! let runtime = PubSubRuntime::from_config(config, components, prometheus::default_registry())?;
//! runtime.subscribe("orders", "created", "/orders").await?;
//! runtime.publish(PublishRequest::new("orders", "created", b"{}".to_vec())).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::access::qualify_topic;
use crate::component::{BulkPublishRequest, BulkPublishResponse, PubSubComponent, PublishRequest};
use crate::config::{ConfigError, SidecarConfig};
use crate::delivery::{
    AppChannel, AppProtocol, Dispatcher, GrpcChannel, HttpChannel, SubscriptionHandler,
};
use crate::diagnostics::ComponentMetrics;
use crate::error::PubSubError;
use crate::publish::PubSubAdapter;
use crate::registry::{ComponentRegistry, PubSubEntry};
use crate::resiliency::PolicyRunner;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("failed to build HTTP app channel: {0}")]
    HttpChannel(#[from] reqwest::Error),
    #[error("failed to build gRPC app channel: {0}")]
    GrpcChannel(#[from] tonic::transport::Error),
    #[error("pubsub {0} is configured but no component instance was provided")]
    MissingComponent(String),
}

/// The sidecar's pub/sub surface: publish, bulk publish, subscribe.
pub struct PubSubRuntime {
    config: SidecarConfig,
    registry: Arc<ComponentRegistry>,
    runner: Arc<PolicyRunner>,
    adapter: PubSubAdapter<PolicyRunner>,
    dispatcher: Dispatcher,
    metrics: ComponentMetrics,
    cancel: CancellationToken,
}

impl PubSubRuntime {
    /// Build a runtime whose app channel follows `config.app`.
    ///
    /// A gRPC channel connects lazily, so this must run inside a tokio
    /// runtime.
    pub fn from_config(
        config: SidecarConfig,
        components: HashMap<String, Arc<dyn PubSubComponent>>,
        metrics_registry: &prometheus::Registry,
    ) -> Result<Self, RuntimeError> {
        let channel: Arc<dyn AppChannel> = match config.app.protocol {
            AppProtocol::Http => Arc::new(HttpChannel::new(&config.app.address, config.app.timeout())?),
            AppProtocol::Grpc => Arc::new(GrpcChannel::lazy(&config.app.address, config.app.timeout())?),
        };
        Self::with_channel(config, components, channel, metrics_registry)
    }

    /// Build a runtime around an existing app channel.
    pub fn with_channel(
        config: SidecarConfig,
        mut components: HashMap<String, Arc<dyn PubSubComponent>>,
        channel: Arc<dyn AppChannel>,
        metrics_registry: &prometheus::Registry,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let registry = Arc::new(ComponentRegistry::new());
        for declared in &config.pubsubs {
            let component = components
                .remove(&declared.name)
                .ok_or_else(|| RuntimeError::MissingComponent(declared.name.clone()))?;
            registry.insert(
                PubSubEntry::new(&declared.name, component)
                    .with_scoping(declared.scoping.clone())
                    .with_namespace_scoped(declared.namespace_scoped),
            );
        }
        // Components without a declaration are unrestricted.
        for (name, component) in components {
            registry.insert(PubSubEntry::new(name, component));
        }

        let metrics = ComponentMetrics::new(&config.app_id, &config.namespace, metrics_registry)?;
        let runner = Arc::new(PolicyRunner::new(config.resiliency.clone()));
        let adapter = PubSubAdapter::new(
            &config.app_id,
            &config.namespace,
            Arc::clone(&registry),
            Arc::clone(&runner),
        )
        .with_observer(Arc::new(metrics.clone()));
        let dispatcher = Dispatcher::new(channel).with_observer(Arc::new(metrics.clone()));

        info!(
            app_id = %config.app_id,
            protocol = ?dispatcher.protocol(),
            pubsubs = ?registry.names(),
            "pub/sub runtime ready"
        );

        Ok(Self {
            config,
            registry,
            runner,
            adapter,
            dispatcher,
            metrics,
            cancel: CancellationToken::new(),
        })
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<(), PubSubError> {
        self.adapter.publish(request).await
    }

    pub async fn bulk_publish(
        &self,
        request: BulkPublishRequest,
    ) -> Result<BulkPublishResponse, PubSubError> {
        self.adapter.bulk_publish(request).await
    }

    /// Route messages on `topic` to the app's `path`.
    ///
    /// The subscribe scope is checked on the unqualified topic; the
    /// component subscribes to the namespace-qualified one.
    pub async fn subscribe(&self, pubsub_name: &str, topic: &str, path: &str) -> Result<(), PubSubError> {
        let entry = self
            .registry
            .get(pubsub_name)
            .ok_or_else(|| PubSubError::NotFound {
                pubsub_name: pubsub_name.to_string(),
            })?;
        if !entry.scoping.can_subscribe(topic) {
            return Err(PubSubError::NotAllowed {
                topic: topic.to_string(),
                app_id: self.config.app_id.clone(),
            });
        }

        let qualified = qualify_topic(&self.config.namespace, topic, entry.namespace_scoped);
        let handler = SubscriptionHandler::new(
            self.dispatcher.clone(),
            Arc::clone(&self.runner),
            self.cancel.child_token(),
        );
        entry
            .component
            .subscribe(&qualified, path, Arc::new(handler))
            .await?;
        info!(pubsub = %pubsub_name, topic = %qualified, path, "subscribed");
        Ok(())
    }

    /// Cancel in-flight deliveries; they resolve to retry.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &ComponentMetrics {
        &self.metrics
    }
}
