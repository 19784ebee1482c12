//! Ephemeral runner: a queue-group subscription straight on the broker.

use std::sync::Arc;

use courier_broker::{Broker, Message, Subscription};
use courier_protocol::Subject;

use super::{Lifecycle, RunnerState, ServiceHandle};
use crate::dispatch::{send_reply, Dispatcher};
use crate::registry::SubscriptionRegistry;
use crate::types::{RequestContext, RpcError};

pub(crate) struct EphemeralSpec {
    pub subject: Subject,
    pub queue: String,
    pub dispatcher: Dispatcher,
}

pub(crate) async fn spawn_ephemeral(
    broker: Arc<dyn Broker>,
    registry: Arc<SubscriptionRegistry>,
    spec: EphemeralSpec,
) -> Result<ServiceHandle, RpcError> {
    let lifecycle = Arc::new(Lifecycle::new(spec.subject.service(), spec.subject.method()));
    lifecycle.set(RunnerState::Subscribing);

    let sub = match broker.subscribe(spec.subject.as_str(), Some(spec.queue.as_str())).await {
        Ok(sub) => sub,
        Err(e) => {
            lifecycle.set(RunnerState::Closed);
            return Err(RpcError::Transport(e));
        }
    };
    let handle = sub.handle();
    lifecycle.set(RunnerState::Running);
    tracing::info!(
        subject = %spec.subject,
        queue = %spec.queue,
        "method registered"
    );

    let service = ServiceHandle::new(&spec.subject, lifecycle.clone(), handle.clone());
    registry.spawn_tracked(
        handle,
        Some(lifecycle.clone()),
        run(broker, registry.clone(), lifecycle, sub, spec),
    );
    Ok(service)
}

async fn run(
    broker: Arc<dyn Broker>,
    registry: Arc<SubscriptionRegistry>,
    lifecycle: Arc<Lifecycle>,
    mut sub: Subscription<Message>,
    spec: EphemeralSpec,
) {
    let id = sub.id();
    while let Some(msg) = sub.next().await {
        let ctx = RequestContext {
            subject: msg.subject.clone(),
            service: spec.subject.service().to_string(),
            method: spec.subject.method().to_string(),
            reply: msg.reply.clone(),
            sequence: None,
            delivered: None,
        };
        let outcome = spec.dispatcher.dispatch(ctx, &msg.payload).await;
        tracing::debug!(subject = %spec.subject, outcome = outcome.label(), "request handled");

        if let Some(reply) = &msg.reply {
            send_reply(broker.as_ref(), spec.subject.as_str(), reply, &outcome.envelope()).await;
        }
    }

    registry.unregister(id);
    lifecycle.set(RunnerState::Closed);
    tracing::debug!(subject = %spec.subject, "method loop ended");
}
