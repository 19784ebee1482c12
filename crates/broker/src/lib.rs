//! `courier-broker`: the transport contracts Courier is built on, plus an
//! in-process implementation.
//!
//! Courier never talks to a network itself.  It consumes two traits:
//!
//! - [`Broker`]: subject-based publish/subscribe with queue groups and
//!   request/reply (reply inboxes, "no responders" detection, timeouts).
//! - [`LogBroker`]: a persistent log facility: streams bound to subject
//!   filters, durable consumers with explicit acknowledgement, and
//!   redelivery on negative acknowledgement.
//!
//! [`MemoryBroker`] implements both in a single process.  It is what the
//! test-suites and the demo binary run against, and it reproduces the
//! behaviours the RPC layer depends on (queue-group round robin, durable
//! cursors, backlog delivery to late subscribers, `max_ack_pending`
//! backpressure, nak redelivery).

pub mod error;
pub mod log;
pub mod memory;
pub mod message;
pub mod pattern;
pub mod subscription;

use std::time::Duration;

use async_trait::async_trait;

pub use error::BrokerError;
pub use log::{
    AckPolicy, ConsumerConfig, ConsumerInfo, PublishAck, RetentionPolicy, StreamConfig, StreamInfo,
};
pub use memory::MemoryBroker;
pub use message::{Acker, LogMessage, Message};
pub use subscription::{LogSubscription, Subscription, SubscriptionControl, SubscriptionHandle};

/// Core publish/subscribe transport.
///
/// Implementations must be safe to share across tasks; every method may be
/// called concurrently.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Subscribe to `subject` (wildcards allowed).  With `queue`, each
    /// message is delivered to only one member of the group.
    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<Subscription, BrokerError>;

    /// Fire-and-forget publish, optionally carrying a reply address.
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply: Option<&str>,
    ) -> Result<(), BrokerError>;

    /// Publish with a private reply inbox and wait for the first reply.
    ///
    /// Fails with [`BrokerError::NoResponders`] when nobody is subscribed to
    /// `subject`, and with [`BrokerError::Timeout`] when nobody answers in
    /// time.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, BrokerError>;

    /// A fresh, unique reply address.
    fn new_reply_address(&self) -> String;
}

/// Persistent log facility.
#[async_trait]
pub trait LogBroker: Send + Sync + 'static {
    /// Look up a stream.  [`BrokerError::NotFound`] when it does not exist.
    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BrokerError>;

    /// Create a stream.  [`BrokerError::AlreadyExists`] when the name is
    /// taken.
    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError>;

    /// Append a message to whichever stream captures `subject`.
    async fn publish_to_log(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply: Option<&str>,
    ) -> Result<PublishAck, BrokerError>;

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<ConsumerInfo, BrokerError>;

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError>;

    /// Attach to an existing durable consumer.  Subscribers sharing the same
    /// `queue` split the deliveries between them.
    async fn subscribe_durable(
        &self,
        stream: &str,
        durable: &str,
        queue: Option<&str>,
    ) -> Result<LogSubscription, BrokerError>;
}
