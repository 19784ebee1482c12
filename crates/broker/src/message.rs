//! Inbound message types.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BrokerError;

/// A message delivered on a core subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Where the publisher expects an answer, if anywhere.
    pub reply: Option<String>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>, reply: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply,
        }
    }
}

/// Settles deliveries of one durable consumer.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, sequence: u64) -> Result<(), BrokerError>;
    async fn nak(&self, sequence: u64) -> Result<(), BrokerError>;
}

/// A message delivered from a durable log.
///
/// Must be settled with [`ack`](Self::ack) or [`nak`](Self::nak); an
/// unsettled delivery counts against the consumer's `max_ack_pending`.
pub struct LogMessage {
    pub message: Message,
    pub stream: String,
    /// Stream sequence of the stored message.
    pub sequence: u64,
    /// How many times this message has been delivered, this one included.
    pub delivered: u32,
    pub published: DateTime<Utc>,
    acker: Arc<dyn Acker>,
}

impl LogMessage {
    pub fn new(
        message: Message,
        stream: impl Into<String>,
        sequence: u64,
        delivered: u32,
        published: DateTime<Utc>,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            message,
            stream: stream.into(),
            sequence,
            delivered,
            published,
            acker,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn reply(&self) -> Option<&str> {
        self.message.reply.as_deref()
    }

    /// Acknowledge: the message will not be delivered again.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack(self.sequence).await
    }

    /// Negative acknowledgement: request redelivery.
    pub async fn nak(&self) -> Result<(), BrokerError> {
        self.acker.nak(self.sequence).await
    }
}

impl fmt::Debug for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMessage")
            .field("subject", &self.message.subject)
            .field("stream", &self.stream)
            .field("sequence", &self.sequence)
            .field("delivered", &self.delivered)
            .field("reply", &self.message.reply)
            .finish()
    }
}
