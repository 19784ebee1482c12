//! Durable runner: provisions the method's stream, binds the shared durable
//! consumer and settles every delivery after replying.

use std::sync::Arc;

use courier_broker::{Broker, BrokerError, LogBroker, LogMessage, LogSubscription};
use courier_protocol::Subject;

use super::{Lifecycle, RunnerState, ServiceHandle};
use crate::config::{ConsumerSettings, FailurePolicy, StreamSettings};
use crate::dispatch::{send_reply, DispatchOutcome, Dispatcher};
use crate::provisioner::StreamProvisioner;
use crate::registry::SubscriptionRegistry;
use crate::types::{RequestContext, RpcError};

pub(crate) struct DurableSpec {
    pub subject: Subject,
    pub queue: Option<String>,
    pub failure_policy: FailurePolicy,
    pub streams: StreamSettings,
    pub consumers: ConsumerSettings,
    pub dispatcher: Dispatcher,
}

pub(crate) struct DurableDeps {
    pub broker: Arc<dyn Broker>,
    pub log: Arc<dyn LogBroker>,
    pub provisioner: Arc<StreamProvisioner>,
    pub registry: Arc<SubscriptionRegistry>,
}

pub(crate) async fn spawn_durable(
    deps: DurableDeps,
    spec: DurableSpec,
) -> Result<ServiceHandle, RpcError> {
    let lifecycle = Arc::new(Lifecycle::new(spec.subject.service(), spec.subject.method()));
    match subscribe(&deps, &spec, &lifecycle).await {
        Ok((stream, sub)) => {
            let handle = sub.handle();
            lifecycle.set(RunnerState::Running);
            tracing::info!(
                subject = %spec.subject,
                stream = %stream,
                durable = %spec.subject.durable_name(),
                queue = ?spec.queue,
                "durable method registered"
            );

            let service = ServiceHandle::new(&spec.subject, lifecycle.clone(), handle.clone());
            let registry = deps.registry.clone();
            registry.spawn_tracked(
                handle,
                Some(lifecycle.clone()),
                run(deps.broker, deps.registry, lifecycle, sub, spec),
            );
            Ok(service)
        }
        Err(e) => {
            lifecycle.set(RunnerState::Closed);
            tracing::error!(subject = %spec.subject, error = %e, "durable registration failed");
            Err(e)
        }
    }
}

/// Provisioning and Subscribing.
async fn subscribe(
    deps: &DurableDeps,
    spec: &DurableSpec,
    lifecycle: &Lifecycle,
) -> Result<(String, LogSubscription), RpcError> {
    let subject = spec.subject.as_str();
    lifecycle.set(RunnerState::Provisioning);
    let stream = deps.provisioner.ensure_stream(subject, &spec.streams).await?;

    lifecycle.set(RunnerState::Subscribing);
    let durable = spec.subject.durable_name();
    match deps.log.consumer_info(&stream, &durable).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            let config = spec
                .consumers
                .consumer_config(&durable, subject, spec.queue.as_deref());
            match deps.log.create_consumer(&stream, config).await {
                Ok(_) => {
                    tracing::debug!(stream = %stream, durable = %durable, "durable consumer created");
                }
                // Another instance got there first.
                Err(BrokerError::AlreadyExists(_)) => {}
                Err(e) => return Err(RpcError::provisioning(subject, e)),
            }
        }
        Err(e) => return Err(RpcError::provisioning(subject, e)),
    }

    let sub = deps
        .log
        .subscribe_durable(&stream, &durable, spec.queue.as_deref())
        .await
        .map_err(|e| RpcError::provisioning(subject, e))?;
    Ok((stream, sub))
}

async fn run(
    broker: Arc<dyn Broker>,
    registry: Arc<SubscriptionRegistry>,
    lifecycle: Arc<Lifecycle>,
    mut sub: LogSubscription,
    spec: DurableSpec,
) {
    let id = sub.id();
    while let Some(msg) = sub.next().await {
        let ctx = RequestContext {
            subject: msg.message.subject.clone(),
            service: spec.subject.service().to_string(),
            method: spec.subject.method().to_string(),
            reply: msg.message.reply.clone(),
            sequence: Some(msg.sequence),
            delivered: Some(msg.delivered),
        };
        let outcome = spec.dispatcher.dispatch(ctx, msg.payload()).await;
        tracing::debug!(
            subject = %spec.subject,
            seq = msg.sequence,
            delivered = msg.delivered,
            outcome = outcome.label(),
            "job handled"
        );

        if let Some(reply) = msg.reply() {
            send_reply(broker.as_ref(), spec.subject.as_str(), reply, &outcome.envelope()).await;
        }
        settle(&msg, &outcome, spec.failure_policy).await;
    }

    registry.unregister(id);
    lifecycle.set(RunnerState::Closed);
    tracing::debug!(subject = %spec.subject, "durable loop ended");
}

/// Ack unless the handler failed under [`FailurePolicy::Nak`].  Undecodable
/// payloads are always acked: redelivery cannot fix them.
async fn settle(msg: &LogMessage, outcome: &DispatchOutcome, policy: FailurePolicy) {
    let nak = policy == FailurePolicy::Nak && outcome.handler_failed();
    let result = if nak { msg.nak().await } else { msg.ack().await };
    if let Err(e) = result {
        tracing::warn!(
            subject = %msg.message.subject,
            seq = msg.sequence,
            nak,
            error = %e,
            "failed to settle job"
        );
    }
}
