//! Persistent log configuration and info types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When stored messages may be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep until size/age limits are hit.
    #[default]
    Limits,
    /// Keep while some consumer has not yet acknowledged; a message no
    /// consumer wants is dropped on arrival.
    Interest,
    /// Remove once acknowledged by a consumer.
    WorkQueue,
}

/// Stream definition.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    /// Subject filters captured by this stream.
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    /// `None` = unlimited.
    pub max_age: Option<Duration>,
    /// `None` = unlimited.
    pub max_bytes: Option<u64>,
    pub num_replicas: usize,
    /// Do not answer publishes with a stream acknowledgement.  Required when
    /// the publisher's reply address belongs to someone else (an RPC
    /// caller), otherwise the stream's own ack would land there first.
    pub no_ack: bool,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::Limits,
            max_age: None,
            max_bytes: None,
            num_replicas: 1,
            no_ack: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub created: DateTime<Utc>,
    /// Number of stored messages.
    pub messages: u64,
    pub bytes: u64,
    pub last_sequence: u64,
    pub consumers: usize,
}

/// Acknowledgement requirement of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Every delivery must be acked individually.
    #[default]
    Explicit,
    /// Deliveries are considered acked when sent.
    None,
}

/// Durable consumer definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: Option<String>,
    pub ack_policy: AckPolicy,
    /// Give up on a message after this many deliveries.  `None` = never.
    pub max_deliver: Option<u32>,
    /// Upper bound on unacknowledged deliveries in flight.
    pub max_ack_pending: usize,
    /// Queue group allowed to bind to this consumer.
    pub deliver_group: Option<String>,
}

impl ConsumerConfig {
    pub fn new(durable_name: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject: None,
            ack_policy: AckPolicy::Explicit,
            max_deliver: None,
            max_ack_pending: 1000,
            deliver_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub stream: String,
    pub config: ConsumerConfig,
    /// Matching messages not yet delivered to anyone.
    pub num_pending: u64,
    /// Delivered but not yet acknowledged.
    pub num_ack_pending: usize,
    /// Waiting for redelivery after a nak or a departed subscriber.
    pub num_redelivery: usize,
    pub delivered: u64,
    pub acked: u64,
    /// Messages dropped after reaching `max_deliver`.
    pub terminated: u64,
}

/// Acknowledgement returned by [`LogBroker::publish_to_log`](crate::LogBroker::publish_to_log).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub stream: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
}
