//! Core types for handlers and callers: context, results, and errors.

use courier_broker::BrokerError;
use courier_protocol::SubjectError;
use serde_json::Value;

/// Context provided to every handler invocation.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Full subject the request arrived on (e.g. `"orders.create"`).
    pub subject: String,
    pub service: String,
    pub method: String,
    /// Reply address of the caller, if it expects an answer.
    pub reply: Option<String>,

    // ── Durable path only ────────────────────────────────────────
    /// Stream sequence of the job.
    pub sequence: Option<u64>,
    /// Delivery attempt, starting at 1.  Greater than 1 means redelivery.
    pub delivered: Option<u32>,
}

/// Result type for handlers.
pub type HandlerResult = Result<Value, HandlerError>;

/// Failure reported by a handler.
///
/// The runner turns it into an `Err` envelope carrying `message`, `kind`
/// and `detail`; callers receive it as [`RpcError::Remote`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub kind: Option<String>,
    pub detail: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            detail: None,
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(message).with_kind("invalid_args")
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::invalid_args(e.to_string())
    }
}

/// Every failure a caller or a service registration can observe.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    /// No reply within the deadline.  Never retried.
    #[error("request to {subject} timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },

    /// Nobody subscribed, even after retrying.
    #[error("no responders for {subject} after {attempts} attempts")]
    NoResponders { subject: String, attempts: u32 },

    /// The handler reported a failure.
    #[error("remote error from {subject}: {message}")]
    Remote {
        subject: String,
        message: String,
        kind: Option<String>,
        detail: Option<Value>,
    },

    #[error("malformed payload on {subject}: {reason}")]
    MalformedPayload { subject: String, reason: String },

    /// Stream or durable consumer setup failed.
    #[error("provisioning failed for {subject}: {source}")]
    Provisioning {
        subject: String,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),

    #[error("config: {0}")]
    Config(String),

    /// Any other transport failure, unmodified.
    #[error(transparent)]
    Transport(#[from] BrokerError),
}

impl RpcError {
    pub(crate) fn provisioning(subject: impl Into<String>, source: BrokerError) -> Self {
        RpcError::Provisioning {
            subject: subject.into(),
            source,
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Timeout { .. } => "timeout",
            RpcError::NoResponders { .. } => "no_responders",
            RpcError::Remote { .. } => "remote",
            RpcError::MalformedPayload { .. } => "malformed_payload",
            RpcError::Provisioning { .. } => "provisioning",
            RpcError::InvalidSubject(_) => "invalid_subject",
            RpcError::Config(_) => "config",
            RpcError::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_builders() {
        let e = HandlerError::new("out of stock")
            .with_kind("conflict")
            .with_detail(serde_json::json!({"sku": "A-1"}));
        assert_eq!(e.to_string(), "out of stock");
        assert_eq!(e.kind.as_deref(), Some("conflict"));
        assert!(e.detail.is_some());
    }

    #[test]
    fn json_errors_become_invalid_args() {
        let err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let e: HandlerError = err.into();
        assert_eq!(e.kind.as_deref(), Some("invalid_args"));
    }

    #[test]
    fn rpc_error_messages_carry_context() {
        let e = RpcError::Timeout {
            subject: "orders.create".into(),
            timeout_ms: 50,
        };
        assert_eq!(e.to_string(), "request to orders.create timed out after 50ms");
        assert_eq!(e.kind(), "timeout");

        let e = RpcError::NoResponders {
            subject: "orders.create".into(),
            attempts: 3,
        };
        assert!(e.to_string().contains("3 attempts"));

        let e: RpcError = BrokerError::Closed.into();
        assert_eq!(e.kind(), "transport");
        assert_eq!(e.to_string(), "connection closed");
    }
}
