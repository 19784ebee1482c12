//! Fire-and-forget events.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use courier_broker::{Broker, Message, Subscription, SubscriptionHandle};
use futures_util::FutureExt;
use serde_json::Value;

use crate::handler::{Event, EventHandler};
use crate::registry::SubscriptionRegistry;
use crate::types::RpcError;

/// Publish `payload` as JSON on `subject`.  Nobody listening is not an error.
pub async fn emit(broker: &dyn Broker, subject: &str, payload: &Value) -> Result<(), RpcError> {
    let bytes = serde_json::to_vec(payload).map_err(|e| RpcError::MalformedPayload {
        subject: subject.to_string(),
        reason: e.to_string(),
    })?;
    broker.publish(subject, bytes, None).await?;
    Ok(())
}

/// A live event subscription.  Dropping it does not stop delivery; call
/// [`unsubscribe`](Self::unsubscribe) or drain the owning `Courier`.
#[derive(Debug)]
pub struct EventSubscription {
    handle: SubscriptionHandle,
    registry: Arc<SubscriptionRegistry>,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn subject(&self) -> &str {
        self.handle.subject()
    }

    /// Stop receiving events immediately.
    pub async fn unsubscribe(self) -> Result<(), RpcError> {
        self.registry.unregister(self.handle.id());
        self.handle.unsubscribe().await?;
        Ok(())
    }
}

pub(crate) async fn subscribe(
    broker: &dyn Broker,
    registry: Arc<SubscriptionRegistry>,
    subject: &str,
    queue: Option<&str>,
    handler: Arc<dyn EventHandler>,
) -> Result<EventSubscription, RpcError> {
    let sub = broker.subscribe(subject, queue).await?;
    let handle = sub.handle();
    tracing::info!(subject = %subject, queue = ?queue, "event subscription started");

    registry.spawn_tracked(handle.clone(), None, run(registry.clone(), sub, handler));
    Ok(EventSubscription { handle, registry })
}

async fn run(
    registry: Arc<SubscriptionRegistry>,
    mut sub: Subscription<Message>,
    handler: Arc<dyn EventHandler>,
) {
    let id = sub.id();
    while let Some(msg) = sub.next().await {
        let payload = if msg.payload.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&msg.payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(subject = %msg.subject, error = %e, "dropping undecodable event");
                    continue;
                }
            }
        };
        let subject = msg.subject;
        let event = Event {
            subject: subject.clone(),
            payload,
        };
        if AssertUnwindSafe(handler.handle(event))
            .catch_unwind()
            .await
            .is_err()
        {
            tracing::error!(subject = %subject, "event handler panicked");
        }
    }
    registry.unregister(id);
}
