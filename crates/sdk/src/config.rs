//! Configuration: call defaults, stream provisioning, durable consumers and
//! payload limits.
//!
//! Every section is optional in TOML; omitted fields fall back to the
//! defaults below.

use std::path::Path;
use std::time::Duration;

use courier_broker::{AckPolicy, ConsumerConfig, RetentionPolicy, StreamConfig};
use serde::{Deserialize, Serialize};

use crate::backoff::RetryBackoff;
use crate::types::RpcError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub calls: CallOptions,
    #[serde(default)]
    pub streams: StreamSettings,
    #[serde(default)]
    pub consumers: ConsumerSettings,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, RpcError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| RpcError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(RpcError::Config(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.calls.timeout_ms == 0 {
            return Err(RpcError::Config("calls.timeout_ms must be > 0".into()));
        }
        if self.streams.num_replicas == 0 {
            return Err(RpcError::Config("streams.num_replicas must be >= 1".into()));
        }
        if self.consumers.max_ack_pending == 0 {
            return Err(RpcError::Config("consumers.max_ack_pending must be >= 1".into()));
        }
        if self.limits.max_payload_bytes == 0 {
            return Err(RpcError::Config("limits.max_payload_bytes must be > 0".into()));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call timeout and retry policy.
///
/// `retry_delay_ms` above `max_retry_delay_ms` is clamped, not rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after the first one, on "no responders" only.
    #[serde(default = "d_retries")]
    pub retries: u32,
    #[serde(default = "d_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "d_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout_ms: d_timeout_ms(),
            retries: d_retries(),
            retry_delay_ms: d_retry_delay_ms(),
            max_retry_delay_ms: d_max_retry_delay_ms(),
        }
    }
}

impl CallOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Base retry delay, clamped to the maximum.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.min(self.max_retry_delay_ms))
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.retry_delay(), self.max_retry_delay())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_ms = delay.as_millis() as u64;
        self
    }
}

fn d_timeout_ms() -> u64 {
    10_000
}

fn d_retries() -> u32 {
    3
}

fn d_retry_delay_ms() -> u64 {
    1_000
}

fn d_max_retry_delay_ms() -> u64 {
    20_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Template for streams created by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// `0` = unlimited.
    #[serde(default = "d_max_age_secs")]
    pub max_age_secs: u64,
    /// `0` = unlimited.
    #[serde(default)]
    pub max_bytes: u64,
    #[serde(default = "d_num_replicas")]
    pub num_replicas: usize,
    /// Keep `true` for RPC streams: callers put their own reply inbox on
    /// the message and must not receive the stream's publish ack there.
    #[serde(default = "d_true")]
    pub no_ack: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            max_age_secs: d_max_age_secs(),
            max_bytes: 0,
            num_replicas: d_num_replicas(),
            no_ack: d_true(),
        }
    }
}

impl StreamSettings {
    /// Concrete stream definition capturing exactly `subject`.
    pub fn stream_config(&self, name: &str, subject: &str) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            subjects: vec![subject.to_string()],
            retention: self.retention,
            max_age: (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs)),
            max_bytes: (self.max_bytes > 0).then_some(self.max_bytes),
            num_replicas: self.num_replicas,
            no_ack: self.no_ack,
        }
    }
}

fn d_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn d_num_replicas() -> usize {
    1
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consumers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a durable runner settles a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Acknowledge anyway; the error reply is the only report.
    #[default]
    Ack,
    /// Negative-acknowledge so the log redelivers.
    Nak,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// `0` = unlimited.
    #[serde(default)]
    pub max_deliver: u32,
    #[serde(default = "d_max_ack_pending")]
    pub max_ack_pending: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_deliver: 0,
            max_ack_pending: d_max_ack_pending(),
        }
    }
}

impl ConsumerSettings {
    pub fn consumer_config(
        &self,
        durable: &str,
        subject: &str,
        queue: Option<&str>,
    ) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: durable.to_string(),
            filter_subject: Some(subject.to_string()),
            ack_policy: AckPolicy::Explicit,
            max_deliver: (self.max_deliver > 0).then_some(self.max_deliver),
            max_ack_pending: self.max_ack_pending,
            deliver_group: queue.map(str::to_string),
        }
    }
}

fn d_max_ack_pending() -> usize {
    1_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Inbound request payloads above this size are rejected as malformed.
    #[serde(default = "d_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: d_max_payload_bytes(),
        }
    }
}

fn d_max_payload_bytes() -> usize {
    1024 * 1024
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-service overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Options for one service registration.  Unset fields use the
/// [`Config`] defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceOptions {
    /// Queue group; the ephemeral runner defaults to the service name.
    pub queue: Option<String>,
    pub failure_policy: Option<FailurePolicy>,
    pub streams: Option<StreamSettings>,
}

impl ServiceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn streams(mut self, streams: StreamSettings) -> Self {
        self.streams = Some(streams);
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
