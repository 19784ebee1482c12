//! Log-backed calls: the request is stored in the method's stream before any
//! responder sees it, so it survives responder restarts.

use std::sync::Arc;

use courier_broker::{Broker, BrokerError, LogBroker, PublishAck};
use serde_json::Value;

use crate::client::decode_reply;
use crate::config::{CallOptions, StreamSettings};
use crate::provisioner::StreamProvisioner;
use crate::registry::SubscriptionRegistry;
use crate::types::RpcError;

pub struct PersistentClient {
    broker: Arc<dyn Broker>,
    log: Arc<dyn LogBroker>,
    provisioner: Arc<StreamProvisioner>,
    registry: Arc<SubscriptionRegistry>,
}

impl PersistentClient {
    pub fn new(
        broker: Arc<dyn Broker>,
        log: Arc<dyn LogBroker>,
        provisioner: Arc<StreamProvisioner>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            broker,
            log,
            provisioner,
            registry,
        }
    }

    /// Publish `payload` into the stream for `subject` with a private reply
    /// inbox and wait up to the call timeout for the answer.
    ///
    /// Not retried: the job stays in the log until a durable runner takes it,
    /// even if this call times out first.
    pub async fn call(
        &self,
        subject: &str,
        payload: Vec<u8>,
        streams: &StreamSettings,
        options: &CallOptions,
    ) -> Result<Value, RpcError> {
        // The stream may have been created by a service with its own
        // settings, so ack handling follows the stream, not `streams`.
        let stream = self.provisioner.ensure_stream_config(subject, streams).await?;

        let inbox = self.broker.new_reply_address();
        let mut replies = self.broker.subscribe(&inbox, None).await?;
        let handle = replies.handle();
        self.registry.register(handle.clone());

        let result: Result<Value, RpcError> = async {
            let ack = self.log.publish_to_log(subject, payload, Some(&inbox)).await?;
            tracing::debug!(subject = %subject, stream = %stream.name, seq = ack.sequence, "job published");

            let wait = async {
                while let Some(msg) = replies.next().await {
                    // With stream acks enabled the log answers on our inbox too.
                    if !stream.no_ack && is_own_ack(&msg.payload, &ack) {
                        continue;
                    }
                    return Some(msg);
                }
                None
            };
            match tokio::time::timeout(options.timeout(), wait).await {
                Ok(Some(msg)) => decode_reply(subject, &msg.payload),
                Ok(None) => Err(RpcError::Transport(BrokerError::Closed)),
                Err(_) => Err(RpcError::Timeout {
                    subject: subject.to_string(),
                    timeout_ms: options.timeout_ms,
                }),
            }
        }
        .await;

        self.registry.unregister(handle.id());
        if let Err(e) = handle.unsubscribe().await {
            tracing::debug!(subject = %subject, error = %e, "reply inbox already gone");
        }
        result
    }

    /// Store a job for `subject` without waiting for anyone to process it.
    pub async fn enqueue(
        &self,
        subject: &str,
        payload: Vec<u8>,
        streams: &StreamSettings,
    ) -> Result<PublishAck, RpcError> {
        self.provisioner.ensure_stream(subject, streams).await?;
        let ack = self.log.publish_to_log(subject, payload, None).await?;
        tracing::debug!(subject = %subject, stream = %ack.stream, seq = ack.sequence, "job enqueued");
        Ok(ack)
    }
}

fn is_own_ack(payload: &[u8], ack: &PublishAck) -> bool {
    serde_json::from_slice::<PublishAck>(payload).is_ok_and(|got| got == *ack)
}
