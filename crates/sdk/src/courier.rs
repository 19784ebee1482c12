//! The assembled RPC layer: one shared connection, the runners started on
//! it and the registry that shuts them down.

use std::sync::Arc;

use courier_broker::{Broker, LogBroker, PublishAck};
use courier_protocol::{encode_args, Subject};
use serde_json::Value;

use crate::builder::CourierBuilder;
use crate::client::RequestClient;
use crate::config::{CallOptions, Config, ServiceOptions};
use crate::dispatch::Dispatcher;
use crate::events::{self, EventSubscription};
use crate::handler::{EventHandler, Handler};
use crate::persistent::PersistentClient;
use crate::provisioner::StreamProvisioner;
use crate::registry::{DrainReport, SubscriptionRegistry};
use crate::runner::{
    spawn_durable, spawn_ephemeral, DurableDeps, DurableSpec, EphemeralSpec, ServiceHandle,
};
use crate::types::RpcError;

/// Log-backed half, present only when a [`LogBroker`] was supplied.
struct Durable {
    log: Arc<dyn LogBroker>,
    provisioner: Arc<StreamProvisioner>,
    client: PersistentClient,
}

/// Entry point for services and callers.
///
/// Create via [`Courier::builder`].  All methods take `&self`; share the
/// value behind an `Arc` between tasks.
pub struct Courier {
    broker: Arc<dyn Broker>,
    config: Config,
    client: RequestClient,
    durable: Option<Durable>,
    registry: Arc<SubscriptionRegistry>,
}

impl Courier {
    pub fn builder() -> CourierBuilder {
        CourierBuilder::new()
    }

    pub(crate) fn from_parts(
        broker: Arc<dyn Broker>,
        log: Option<Arc<dyn LogBroker>>,
        config: Config,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let durable = log.map(|log| {
            let provisioner = Arc::new(StreamProvisioner::new(log.clone()));
            let client = PersistentClient::new(
                broker.clone(),
                log.clone(),
                provisioner.clone(),
                registry.clone(),
            );
            Durable {
                log,
                provisioner,
                client,
            }
        });
        Self {
            client: RequestClient::new(broker.clone()),
            broker,
            config,
            durable,
            registry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Default options applied by [`call`](Self::call).
    pub fn call_options(&self) -> CallOptions {
        self.config.calls.clone()
    }

    /// Whether durable operations are available.
    pub fn has_log(&self) -> bool {
        self.durable.is_some()
    }

    /// Number of live subscriptions (runners, events, pending persistent
    /// calls).
    pub fn active_subscriptions(&self) -> usize {
        self.registry.len()
    }

    // ── Direct path ──────────────────────────────────────────────────

    /// Serve `service.method` on the broker, load-balanced across every
    /// instance in the service's queue group.
    pub async fn register_method<H: Handler>(
        &self,
        service: &str,
        method: &str,
        handler: H,
    ) -> Result<ServiceHandle, RpcError> {
        self.register_method_with(service, method, handler, ServiceOptions::default())
            .await
    }

    pub async fn register_method_with<H: Handler>(
        &self,
        service: &str,
        method: &str,
        handler: H,
        options: ServiceOptions,
    ) -> Result<ServiceHandle, RpcError> {
        let subject = Subject::new(service, method)?;
        let spec = EphemeralSpec {
            queue: options.queue.unwrap_or_else(|| service.to_string()),
            dispatcher: self.dispatcher(Arc::new(handler)),
            subject,
        };
        spawn_ephemeral(self.broker.clone(), self.registry.clone(), spec).await
    }

    /// Call `service.method` with the default [`CallOptions`].
    pub async fn call(&self, service: &str, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_with(service, method, args, &self.config.calls).await
    }

    pub async fn call_with(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        options: &CallOptions,
    ) -> Result<Value, RpcError> {
        let subject = Subject::new(service, method)?;
        let payload = encode_request(&subject, &args)?;
        self.client.call(subject.as_str(), payload, options).await
    }

    // ── Durable path ─────────────────────────────────────────────────

    /// Serve `service.method` from its stream through the shared durable
    /// consumer.  Jobs published while no instance was running are
    /// processed once one registers.
    pub async fn register_durable_method<H: Handler>(
        &self,
        service: &str,
        method: &str,
        handler: H,
    ) -> Result<ServiceHandle, RpcError> {
        self.register_durable_method_with(service, method, handler, ServiceOptions::default())
            .await
    }

    pub async fn register_durable_method_with<H: Handler>(
        &self,
        service: &str,
        method: &str,
        handler: H,
        options: ServiceOptions,
    ) -> Result<ServiceHandle, RpcError> {
        self.spawn_durable_arc(service, method, Arc::new(handler), options)
            .await
    }

    /// Register several durable methods of one service concurrently.  Each
    /// registration succeeds or fails on its own.
    pub async fn register_durable_methods(
        &self,
        service: &str,
        methods: Vec<(String, Arc<dyn Handler>)>,
        options: ServiceOptions,
    ) -> Vec<(String, Result<ServiceHandle, RpcError>)> {
        let futures = methods.into_iter().map(|(method, handler)| {
            let options = options.clone();
            async move {
                let result = self
                    .spawn_durable_arc(service, &method, handler, options)
                    .await;
                (method, result)
            }
        });
        futures_util::future::join_all(futures).await
    }

    async fn spawn_durable_arc(
        &self,
        service: &str,
        method: &str,
        handler: Arc<dyn Handler>,
        options: ServiceOptions,
    ) -> Result<ServiceHandle, RpcError> {
        let subject = Subject::new(service, method)?;
        let durable = self.require_log(subject.as_str())?;
        let spec = DurableSpec {
            queue: options.queue,
            failure_policy: options
                .failure_policy
                .unwrap_or(self.config.consumers.failure_policy),
            streams: options.streams.unwrap_or_else(|| self.config.streams.clone()),
            consumers: self.config.consumers.clone(),
            dispatcher: self.dispatcher(handler),
            subject,
        };
        let deps = DurableDeps {
            broker: self.broker.clone(),
            log: durable.log.clone(),
            provisioner: durable.provisioner.clone(),
            registry: self.registry.clone(),
        };
        spawn_durable(deps, spec).await
    }

    /// Publish a job into `service.method`'s stream and wait for the reply.
    pub async fn call_persistent(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.call_persistent_with(service, method, args, &self.config.calls)
            .await
    }

    /// Only `timeout_ms` of `options` applies; persistent calls are not
    /// retried.
    pub async fn call_persistent_with(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        options: &CallOptions,
    ) -> Result<Value, RpcError> {
        let subject = Subject::new(service, method)?;
        let durable = self.require_log(subject.as_str())?;
        let payload = encode_request(&subject, &args)?;
        durable
            .client
            .call(subject.as_str(), payload, &self.config.streams, options)
            .await
    }

    /// Store a job for `service.method` without waiting for a reply.
    pub async fn enqueue(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<PublishAck, RpcError> {
        let subject = Subject::new(service, method)?;
        let durable = self.require_log(subject.as_str())?;
        let payload = encode_request(&subject, &args)?;
        durable
            .client
            .enqueue(subject.as_str(), payload, &self.config.streams)
            .await
    }

    // ── Events ───────────────────────────────────────────────────────

    pub async fn emit(&self, subject: &str, payload: &Value) -> Result<(), RpcError> {
        events::emit(self.broker.as_ref(), subject, payload).await
    }

    /// Receive events on `subject` (wildcards allowed).  With `queue`, each
    /// event goes to one member of the group.
    pub async fn subscribe<H: EventHandler>(
        &self,
        subject: &str,
        handler: H,
        queue: Option<&str>,
    ) -> Result<EventSubscription, RpcError> {
        events::subscribe(
            self.broker.as_ref(),
            self.registry.clone(),
            subject,
            queue,
            Arc::new(handler),
        )
        .await
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Stop every subscription gracefully and wait for in-flight handlers.
    pub async fn drain(&self) -> DrainReport {
        tracing::info!(subscriptions = self.registry.len(), "draining");
        self.registry.drain_all().await
    }

    /// Stop every subscription immediately.  Unacknowledged durable jobs
    /// are redelivered to the next consumer.
    pub async fn close(&self) -> usize {
        let closed = self.registry.unsubscribe_all().await;
        tracing::info!(subscriptions = closed, "closed");
        closed
    }

    fn dispatcher(&self, handler: Arc<dyn Handler>) -> Dispatcher {
        Dispatcher::new(handler, self.config.limits.max_payload_bytes)
    }

    fn require_log(&self, subject: &str) -> Result<&Durable, RpcError> {
        self.durable.as_ref().ok_or_else(|| {
            RpcError::Config(format!(
                "no log broker configured, durable operation on {subject} unavailable"
            ))
        })
    }
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("has_log", &self.has_log())
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

fn encode_request(subject: &Subject, args: &[Value]) -> Result<Vec<u8>, RpcError> {
    encode_args(args).map_err(|e| RpcError::MalformedPayload {
        subject: subject.to_string(),
        reason: e.to_string(),
    })
}
