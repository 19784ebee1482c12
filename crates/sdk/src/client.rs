//! Retrying request client for the direct (non-persistent) path.

use std::sync::Arc;

use courier_broker::{Broker, BrokerError};
use courier_protocol::{decode, Decoded, Envelope};
use serde_json::Value;

use crate::config::CallOptions;
use crate::types::RpcError;

/// Issues request/reply calls with a timeout, retrying with jittered
/// exponential back-off while nobody is subscribed.
///
/// A timeout is never retried: a responder that exists but is slow must not
/// be hammered with duplicates.
#[derive(Clone)]
pub struct RequestClient {
    broker: Arc<dyn Broker>,
}

impl RequestClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Send `payload` to `subject` and decode the reply.
    pub async fn call(
        &self,
        subject: &str,
        payload: Vec<u8>,
        options: &CallOptions,
    ) -> Result<Value, RpcError> {
        let timeout = options.timeout();
        let backoff = options.backoff();
        let mut attempt: u32 = 0;

        loop {
            match self.broker.request(subject, payload.clone(), timeout).await {
                Ok(reply) => return decode_reply(subject, &reply.payload),
                Err(BrokerError::Timeout) => {
                    tracing::debug!(subject = %subject, timeout_ms = options.timeout_ms, "request timed out");
                    return Err(RpcError::Timeout {
                        subject: subject.to_string(),
                        timeout_ms: options.timeout_ms,
                    });
                }
                Err(BrokerError::NoResponders(_)) => {
                    if attempt >= options.retries {
                        tracing::warn!(
                            subject = %subject,
                            attempts = attempt + 1,
                            "no responders, giving up"
                        );
                        return Err(RpcError::NoResponders {
                            subject: subject.to_string(),
                            attempts: attempt + 1,
                        });
                    }
                    let delay = backoff.delay_for_attempt(attempt);
                    tracing::debug!(
                        subject = %subject,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "no responders, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(RpcError::Transport(e)),
            }
        }
    }
}

/// Interpret a reply payload.
///
/// `Ok` yields its result, `Err` becomes [`RpcError::Remote`], an empty body
/// is `null` and any other JSON value is returned unchanged.
pub fn decode_reply(subject: &str, payload: &[u8]) -> Result<Value, RpcError> {
    match decode(payload) {
        Ok(Decoded::Empty) => Ok(Value::Null),
        Ok(Decoded::Raw(value)) => Ok(value),
        Ok(Decoded::Envelope(Envelope::Ok { result })) => Ok(result),
        Ok(Decoded::Envelope(Envelope::Err {
            message,
            kind,
            detail,
        })) => Err(RpcError::Remote {
            subject: subject.to_string(),
            message,
            kind,
            detail,
        }),
        Err(e) => Err(RpcError::MalformedPayload {
            subject: subject.to_string(),
            reason: e.to_string(),
        }),
    }
}
