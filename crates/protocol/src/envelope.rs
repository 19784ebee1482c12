//! Reply envelope codec and request argument framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply envelope.
///
/// Exactly one variant is present on the wire, selected by the `status`
/// field.  Anything else is not an RPC reply (see [`Decoded::Raw`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Envelope {
    /// Handler completed; `result` is its return value.
    #[serde(rename = "ok")]
    Ok {
        #[serde(default)]
        result: Value,
    },

    /// Handler (or the runner on its behalf) reported a failure.
    #[serde(rename = "error")]
    Err {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
}

impl Envelope {
    pub fn ok(result: Value) -> Self {
        Envelope::Ok { result }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Envelope::Err {
            message: message.into(),
            kind: None,
            detail: None,
        }
    }

    /// Failure envelope with a machine-readable `kind` and optional detail.
    pub fn err_with(
        message: impl Into<String>,
        kind: Option<String>,
        detail: Option<Value>,
    ) -> Self {
        Envelope::Err {
            message: message.into(),
            kind,
            detail,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Envelope::Ok { .. })
    }
}

/// Result of decoding a reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Zero-length payload ("no body", distinct from JSON `null`).
    Empty,
    /// A well-formed RPC envelope.
    Envelope(Envelope),
    /// Valid JSON that carries no envelope discriminant.
    Raw(Value),
}

/// Codec failures.  Callers treat these as a malformed-payload condition.
#[derive(thiserror::Error, Debug)]
pub enum EnvelopeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed envelope: {0}")]
    Envelope(String),
}

/// Serialize an envelope to bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode a reply payload.
///
/// An object whose `status` is `"ok"` or `"error"` must parse as an
/// [`Envelope`]; if it does not, that is an error rather than a raw value,
/// since the sender clearly meant to speak the protocol.
pub fn decode(bytes: &[u8]) -> Result<Decoded, EnvelopeError> {
    if bytes.is_empty() {
        return Ok(Decoded::Empty);
    }

    let value: Value = serde_json::from_slice(bytes)?;
    let tagged = matches!(
        value.get("status").and_then(Value::as_str),
        Some("ok") | Some("error")
    );
    if !tagged {
        return Ok(Decoded::Raw(value));
    }

    serde_json::from_value::<Envelope>(value)
        .map(Decoded::Envelope)
        .map_err(|e| EnvelopeError::Envelope(e.to_string()))
}

/// Frame call arguments as a JSON array.
pub fn encode_args(args: &[Value]) -> Result<Vec<u8>, EnvelopeError> {
    Ok(serde_json::to_vec(args)?)
}

/// Decode a request payload into positional arguments.
///
/// An empty payload is zero arguments; a non-array JSON value is a single
/// argument.
pub fn decode_args(bytes: &[u8]) -> Result<Vec<Value>, EnvelopeError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}
