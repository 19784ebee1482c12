//! Request dispatch shared by the ephemeral and durable runners: payload
//! decoding, handler invocation and reply encoding.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use courier_broker::Broker;
use courier_protocol::{decode_args, encode, Envelope};
use futures_util::FutureExt;
use serde_json::Value;

use crate::handler::Handler;
use crate::types::{HandlerError, RequestContext};

/// `kind` carried by replies to undecodable requests.
pub const MALFORMED_KIND: &str = "malformed_payload";
/// `kind` carried by replies to requests whose handler panicked.
pub const PANIC_KIND: &str = "panic";

/// What happened to one inbound request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DispatchOutcome {
    /// The payload could not be decoded; the handler was not invoked.
    Malformed(String),
    Success(Value),
    Failed(HandlerError),
}

impl DispatchOutcome {
    pub(crate) fn envelope(&self) -> Envelope {
        match self {
            DispatchOutcome::Malformed(reason) => Envelope::err_with(
                format!("malformed payload: {reason}"),
                Some(MALFORMED_KIND.to_string()),
                None,
            ),
            DispatchOutcome::Success(result) => Envelope::ok(result.clone()),
            DispatchOutcome::Failed(e) => {
                Envelope::err_with(e.message.clone(), e.kind.clone(), e.detail.clone())
            }
        }
    }

    /// The handler ran and reported a failure (including a panic).
    pub(crate) fn handler_failed(&self) -> bool {
        matches!(self, DispatchOutcome::Failed(_))
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Malformed(_) => "malformed",
            DispatchOutcome::Success(_) => "ok",
            DispatchOutcome::Failed(_) => "error",
        }
    }
}

/// Binds a handler to the payload limit it is served under.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    handler: Arc<dyn Handler>,
    max_payload_bytes: usize,
}

impl Dispatcher {
    pub(crate) fn new(handler: Arc<dyn Handler>, max_payload_bytes: usize) -> Self {
        Self {
            handler,
            max_payload_bytes,
        }
    }

    pub(crate) async fn dispatch(&self, ctx: RequestContext, payload: &[u8]) -> DispatchOutcome {
        if payload.len() > self.max_payload_bytes {
            return DispatchOutcome::Malformed(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                payload.len(),
                self.max_payload_bytes
            ));
        }
        let args = match decode_args(payload) {
            Ok(args) => args,
            Err(e) => return DispatchOutcome::Malformed(e.to_string()),
        };

        // catch_unwind: a panicking handler still produces a reply.
        let subject = ctx.subject.clone();
        match AssertUnwindSafe(self.handler.call(ctx, args))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => DispatchOutcome::Success(result),
            Ok(Err(e)) => DispatchOutcome::Failed(e),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(subject = %subject, panic = %msg, "handler panicked");
                DispatchOutcome::Failed(
                    HandlerError::new(format!("handler panicked: {msg}")).with_kind(PANIC_KIND),
                )
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Publish `envelope` to `reply`.  Best effort: failures are logged, never
/// returned, so they cannot affect how the request is settled.
pub(crate) async fn send_reply(broker: &dyn Broker, subject: &str, reply: &str, envelope: &Envelope) {
    let bytes = match encode(envelope) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(subject = %subject, error = %e, "failed to encode reply");
            return;
        }
    };
    if let Err(e) = broker.publish(reply, bytes, None).await {
        tracing::warn!(subject = %subject, reply = %reply, error = %e, "failed to send reply");
    }
}
