//! Subscription handles.
//!
//! A [`Subscription`] is split in two: the stream of inbound messages, which
//! is owned by whichever task consumes it, and a cloneable
//! [`SubscriptionHandle`] that can stop it from elsewhere (typically a
//! shutdown path).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::BrokerError;
use crate::message::{LogMessage, Message};

/// Out-of-band control over a live subscription.
#[async_trait]
pub trait SubscriptionControl: Send + Sync {
    /// Stop new deliveries; messages already buffered are still yielded,
    /// then the stream ends.
    async fn drain(&self) -> Result<(), BrokerError>;

    /// Stop immediately; buffered messages are discarded.
    async fn unsubscribe(&self) -> Result<(), BrokerError>;
}

/// Cloneable handle to a subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    subject: Arc<str>,
    control: Arc<dyn SubscriptionControl>,
}

impl SubscriptionHandle {
    pub fn new(id: u64, subject: &str, control: Arc<dyn SubscriptionControl>) -> Self {
        Self {
            id,
            subject: Arc::from(subject),
            control,
        }
    }

    /// Unique (per broker) subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn drain(&self) -> Result<(), BrokerError> {
        self.control.drain().await
    }

    pub async fn unsubscribe(&self) -> Result<(), BrokerError> {
        self.control.unsubscribe().await
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .finish()
    }
}

/// A live stream of inbound messages.
pub struct Subscription<T = Message> {
    handle: SubscriptionHandle,
    messages: BoxStream<'static, T>,
}

/// Subscription to a durable consumer.
pub type LogSubscription = Subscription<LogMessage>;

impl<T> Subscription<T> {
    pub fn new(handle: SubscriptionHandle, messages: BoxStream<'static, T>) -> Self {
        Self { handle, messages }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<T> {
        self.messages.next().await
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
