//! Subject naming: `(service, method)` to transport subject, stream name and
//! durable consumer name.
//!
//! All three mappings are pure and stable across processes; the stream
//! provisioner relies on that to find a stream created by another instance.

use std::fmt;

use sha2::{Digest, Sha256};

/// Prefix of every stream created for RPC subjects.
pub const STREAM_PREFIX: &str = "RPC_";

/// Why a service or method token was rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {part} token {token:?}: {reason}")]
pub struct SubjectError {
    pub part: &'static str,
    pub token: String,
    pub reason: &'static str,
}

/// A validated `"<service>.<method>"` subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    service: String,
    method: String,
    full: String,
}

impl Subject {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Result<Self, SubjectError> {
        let service = service.into();
        let method = method.into();
        validate_token("service", &service)?;
        validate_token("method", &method)?;
        let full = format!("{service}.{method}");
        Ok(Self {
            service,
            method,
            full,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Name of the durable log backing this subject.
    pub fn stream_name(&self) -> String {
        stream_name_for(&self.full)
    }

    /// Durable consumer name shared by every instance of this method.
    pub fn durable_name(&self) -> String {
        durable_name_for(&self.service, &self.method)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

/// `"{service}.{method}"`, after validating both tokens.
pub fn subject_for(service: &str, method: &str) -> Result<String, SubjectError> {
    Subject::new(service, method).map(|s| s.full)
}

/// Stream identifier for a subject.
///
/// The readable part upper-cases the subject and replaces every
/// non-alphanumeric character with `_`.  Because that alone would map
/// `a.b_c` and `a_b.c` to the same name, the first 4 bytes of the subject's
/// SHA-256 are appended in hex.
pub fn stream_name_for(subject: &str) -> String {
    let readable: String = subject
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    let digest = Sha256::digest(subject.as_bytes());
    format!("{STREAM_PREFIX}{readable}_{}", hex::encode(&digest[..4]))
}

pub fn durable_name_for(service: &str, method: &str) -> String {
    format!("{service}_{method}_durable")
}

fn validate_token(part: &'static str, token: &str) -> Result<(), SubjectError> {
    let reject = |reason| {
        Err(SubjectError {
            part,
            token: token.to_string(),
            reason,
        })
    };
    if token.is_empty() {
        return reject("must not be empty");
    }
    if token.contains('.') {
        return reject("must not contain '.'");
    }
    if token.contains('*') || token.contains('>') {
        return reject("must not contain wildcards");
    }
    if token.chars().any(char::is_whitespace) {
        return reject("must not contain whitespace");
    }
    Ok(())
}
