//! In-process [`Broker`] + [`LogBroker`] implementation.
//!
//! One `MemoryBroker` value plays the role of a connection to a single
//! server.  Clones share the same state, so handing a clone to each
//! "process" in a test is equivalent to several processes connected to the
//! same broker.

mod pubsub;
mod streams;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::message::Message;
use crate::pattern::{is_valid_pattern, is_valid_publish_subject, subject_matches};
use crate::subscription::{Subscription, SubscriptionHandle};
use crate::Broker;

use pubsub::{CoreControl, CoreSub, PubSubState};
use streams::LogState;

/// Prefix of generated reply addresses.
pub const INBOX_PREFIX: &str = "_INBOX";

pub(crate) struct Inner {
    pubsub: Mutex<PubSubState>,
    streams: Mutex<LogState>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Shared in-memory broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pubsub: Mutex::new(PubSubState::default()),
                streams: Mutex::new(LogState::default()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Close the connection: every subscription ends and further calls fail
    /// with [`BrokerError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = self.inner.pubsub.lock().clear();
        self.inner.streams.lock().detach_all();
        tracing::info!(subscriptions = dropped, "memory broker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of core subscriptions whose pattern matches `subject`.
    pub fn interest(&self, subject: &str) -> usize {
        self.inner
            .pubsub
            .lock()
            .patterns()
            .filter(|p| subject_matches(p, subject))
            .count()
    }

    /// Number of live core subscriptions (reply inboxes included).
    pub fn subscription_count(&self) -> usize {
        self.inner.pubsub.lock().len()
    }

    /// Names of all streams, sorted.
    pub fn stream_names(&self) -> Vec<String> {
        self.inner.streams.lock().names()
    }

    /// Number of subscribers currently attached to a durable consumer.
    pub fn durable_subscribers(&self, stream: &str, durable: &str) -> usize {
        self.inner.streams.lock().subscriber_count(stream, durable)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver `msg` to matching core subscribers; returns how many got it.
    fn route(&self, msg: &Message) -> usize {
        self.inner.pubsub.lock().route(msg)
    }
}

/// Turn a channel into a message stream that ends early when `cancel` fires.
fn channel_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
    cancel: CancellationToken,
) -> BoxStream<'static, T> {
    futures_util::stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            msg = rx.recv() => msg,
        };
        next.map(|msg| (msg, (rx, cancel)))
    })
    .boxed()
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<Subscription, BrokerError> {
        self.ensure_open()?;
        if !is_valid_pattern(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }

        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.inner.pubsub.lock().insert(
            id,
            CoreSub {
                pattern: subject.to_string(),
                queue: queue.map(str::to_string),
                tx,
            },
        );
        tracing::trace!(id, subject, queue = ?queue, "subscribed");

        let control = Arc::new(CoreControl::new(Arc::downgrade(&self.inner), id, cancel.clone()));
        Ok(Subscription::new(
            SubscriptionHandle::new(id, subject, control),
            channel_stream(rx, cancel),
        ))
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if !is_valid_publish_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
        let delivered = self.route(&Message::new(subject, payload, reply.map(str::to_string)));
        tracing::trace!(subject, delivered, "published");
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, BrokerError> {
        self.ensure_open()?;
        if !is_valid_publish_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }

        let inbox = self.new_reply_address();
        let mut replies = self.subscribe(&inbox, None).await?;
        let handle = replies.handle();

        let delivered = self.route(&Message::new(subject, payload, Some(inbox)));
        if delivered == 0 {
            handle.unsubscribe().await?;
            return Err(BrokerError::NoResponders(subject.to_string()));
        }

        let reply = tokio::time::timeout(timeout, replies.next()).await;
        handle.unsubscribe().await?;
        match reply {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    fn new_reply_address(&self) -> String {
        format!("{INBOX_PREFIX}.{}", uuid::Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_plain_subscribers() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("events.>", None).await.unwrap();
        let mut b = broker.subscribe("events.user.created", None).await.unwrap();

        broker
            .publish("events.user.created", b"{}".to_vec(), None)
            .await
            .unwrap();

        assert_eq!(a.next().await.unwrap().subject, "events.user.created");
        assert_eq!(b.next().await.unwrap().payload, b"{}");
    }

    #[tokio::test]
    async fn queue_group_delivers_to_one_member_round_robin() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("work.do", Some("workers")).await.unwrap();
        let mut b = broker.subscribe("work.do", Some("workers")).await.unwrap();

        for i in 0..4u8 {
            broker.publish("work.do", vec![i], None).await.unwrap();
        }
        broker.close();

        let mut got_a = Vec::new();
        while let Some(m) = a.next().await {
            got_a.push(m.payload[0]);
        }
        let mut got_b = Vec::new();
        while let Some(m) = b.next().await {
            got_b.push(m.payload[0]);
        }
        assert_eq!(got_a.len(), 2);
        assert_eq!(got_b.len(), 2);
    }

    #[tokio::test]
    async fn queue_cursors_stay_bounded_and_go_with_the_group() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("tenant.*", Some("workers")).await.unwrap();
        let b = broker.subscribe("tenant.*", Some("workers")).await.unwrap();

        for i in 0..64u32 {
            broker
                .publish(&format!("tenant.t{i}"), vec![], None)
                .await
                .unwrap();
        }
        assert_eq!(broker.inner.pubsub.lock().cursor_count(), 1);

        // One cursor per group still alternates across distinct subjects.
        let mut got_a = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), a.next()).await
        {
            got_a += 1;
        }
        assert_eq!(got_a, 32);

        a.handle().unsubscribe().await.unwrap();
        assert_eq!(broker.inner.pubsub.lock().cursor_count(), 1);
        b.handle().unsubscribe().await.unwrap();
        assert_eq!(broker.inner.pubsub.lock().cursor_count(), 0);
    }

    #[tokio::test]
    async fn request_without_subscribers_is_no_responders() {
        let broker = MemoryBroker::new();
        let err = broker
            .request("nobody.home", Vec::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NoResponders("nobody.home".into()));
        // The reply inbox is cleaned up.
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_to_silent_subscriber_times_out() {
        let broker = MemoryBroker::new();
        let _silent = broker.subscribe("slow.op", None).await.unwrap();
        let err = broker
            .request("slow.op", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::Timeout);
    }

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("math.double", None).await.unwrap();
        let responder = broker.clone();
        tokio::spawn(async move {
            if let Some(msg) = sub.next().await {
                let reply = msg.reply.unwrap();
                let n = msg.payload[0] * 2;
                responder.publish(&reply, vec![n], None).await.unwrap();
            }
        });

        let reply = broker
            .request("math.double", vec![21], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, vec![42]);
    }

    #[tokio::test]
    async fn drain_yields_buffered_then_ends() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("a.b", None).await.unwrap();
        broker.publish("a.b", vec![1], None).await.unwrap();
        sub.handle().drain().await.unwrap();
        broker.publish("a.b", vec![2], None).await.unwrap();

        assert_eq!(sub.next().await.unwrap().payload, vec![1]);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_discards_buffered() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("a.b", None).await.unwrap();
        broker.publish("a.b", vec![1], None).await.unwrap();
        sub.handle().unsubscribe().await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_broker_rejects_calls() {
        let broker = MemoryBroker::new();
        broker.close();
        assert_eq!(
            broker.publish("a.b", Vec::new(), None).await.unwrap_err(),
            BrokerError::Closed
        );
        assert!(broker.subscribe("a.b", None).await.is_err());
    }

    #[tokio::test]
    async fn invalid_subjects_rejected() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("a.*", Vec::new(), None).await,
            Err(BrokerError::InvalidSubject(_))
        ));
        assert!(matches!(
            broker.subscribe("", None).await,
            Err(BrokerError::InvalidSubject(_))
        ));
    }
}
