//! Durable log emulation: streams, durable consumers, ack/nak redelivery.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{channel_stream, Inner, MemoryBroker};
use crate::error::BrokerError;
use crate::log::{
    AckPolicy, ConsumerConfig, ConsumerInfo, PublishAck, RetentionPolicy, StreamConfig, StreamInfo,
};
use crate::message::{Acker, LogMessage, Message};
use crate::pattern::{is_valid_pattern, is_valid_publish_subject, subject_matches};
use crate::subscription::{LogSubscription, SubscriptionControl, SubscriptionHandle};
use crate::LogBroker;

struct Stored {
    subject: String,
    payload: Vec<u8>,
    reply: Option<String>,
    published: DateTime<Utc>,
}

struct DurableSub {
    id: u64,
    tx: mpsc::UnboundedSender<LogMessage>,
}

struct MemConsumer {
    config: ConsumerConfig,
    acker: Arc<dyn Acker>,
    /// Next stream sequence to consider for first delivery.
    next_sequence: u64,
    redelivery: VecDeque<u64>,
    /// Unacked deliveries: sequence → subscriber id.
    pending: HashMap<u64, u64>,
    deliveries: HashMap<u64, u32>,
    subscribers: Vec<DurableSub>,
    bound_queue: Option<String>,
    rr: usize,
    delivered: u64,
    acked: u64,
    terminated: u64,
}

impl MemConsumer {
    fn wants(&self, subject: &str) -> bool {
        self.config
            .filter_subject
            .as_deref()
            .map_or(true, |f| subject_matches(f, subject))
    }

    /// Remove a subscriber.  With `requeue`, whatever it had not acked goes
    /// back to the front of the redelivery queue.
    fn detach(&mut self, sub_id: u64, requeue: bool) {
        self.subscribers.retain(|s| s.id != sub_id);
        if self.subscribers.is_empty() {
            self.bound_queue = None;
        }
        if requeue {
            let mut orphaned: Vec<u64> = self
                .pending
                .iter()
                .filter(|(_, owner)| **owner == sub_id)
                .map(|(seq, _)| *seq)
                .collect();
            orphaned.sort_unstable();
            for seq in orphaned.into_iter().rev() {
                self.pending.remove(&seq);
                self.redelivery.push_front(seq);
            }
        }
    }

    /// Push as many messages to subscribers as the ack window allows.
    fn pump(&mut self, stream: &str, messages: &BTreeMap<u64, Stored>) {
        loop {
            if self.subscribers.is_empty() {
                return;
            }
            if self.config.ack_policy == AckPolicy::Explicit
                && self.pending.len() >= self.config.max_ack_pending.max(1)
            {
                return;
            }

            let sequence = match self.redelivery.pop_front() {
                Some(seq) => seq,
                None => {
                    let next = messages
                        .range(self.next_sequence..)
                        .find(|(_, m)| self.wants(&m.subject))
                        .map(|(seq, _)| *seq);
                    match next {
                        Some(seq) => {
                            self.next_sequence = seq + 1;
                            seq
                        }
                        None => {
                            if let Some(last) = messages.keys().next_back() {
                                self.next_sequence = self.next_sequence.max(last + 1);
                            }
                            return;
                        }
                    }
                }
            };

            // Aged out or removed by retention.
            let Some(stored) = messages.get(&sequence) else {
                self.deliveries.remove(&sequence);
                continue;
            };

            let count = self.deliveries.entry(sequence).or_insert(0);
            *count += 1;
            let delivered = *count;
            if let Some(max) = self.config.max_deliver {
                if delivered > max {
                    self.deliveries.remove(&sequence);
                    self.terminated += 1;
                    tracing::debug!(
                        stream,
                        durable = %self.config.durable_name,
                        sequence,
                        max_deliver = max,
                        "message reached max_deliver, dropping"
                    );
                    continue;
                }
            }

            let idx = self.rr % self.subscribers.len();
            self.rr = self.rr.wrapping_add(1);
            let sub_id = self.subscribers[idx].id;
            let msg = LogMessage::new(
                Message::new(stored.subject.clone(), stored.payload.clone(), stored.reply.clone()),
                stream,
                sequence,
                delivered,
                stored.published,
                self.acker.clone(),
            );

            if self.subscribers[idx].tx.send(msg).is_err() {
                if let Some(c) = self.deliveries.get_mut(&sequence) {
                    *c -= 1;
                }
                self.redelivery.push_front(sequence);
                self.detach(sub_id, true);
                continue;
            }

            self.delivered += 1;
            match self.config.ack_policy {
                AckPolicy::Explicit => {
                    self.pending.insert(sequence, sub_id);
                }
                AckPolicy::None => {
                    self.deliveries.remove(&sequence);
                    self.acked += 1;
                }
            }
        }
    }

    /// Whether this consumer will never need `sequence` again.
    fn is_done_with(&self, sequence: u64, subject: &str) -> bool {
        !self.wants(subject)
            || (sequence < self.next_sequence
                && !self.pending.contains_key(&sequence)
                && !self.redelivery.contains(&sequence))
    }

    fn info(&self, stream: &str, messages: &BTreeMap<u64, Stored>) -> ConsumerInfo {
        let num_pending = messages
            .range(self.next_sequence..)
            .filter(|(_, m)| self.wants(&m.subject))
            .count() as u64;
        ConsumerInfo {
            stream: stream.to_string(),
            config: self.config.clone(),
            num_pending,
            num_ack_pending: self.pending.len(),
            num_redelivery: self.redelivery.len(),
            delivered: self.delivered,
            acked: self.acked,
            terminated: self.terminated,
        }
    }
}

struct MemStream {
    config: StreamConfig,
    created: DateTime<Utc>,
    messages: BTreeMap<u64, Stored>,
    last_sequence: u64,
    bytes: u64,
    consumers: BTreeMap<String, MemConsumer>,
}

impl MemStream {
    fn captures(&self, subject: &str) -> bool {
        self.config.subjects.iter().any(|p| subject_matches(p, subject))
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            created: self.created,
            messages: self.messages.len() as u64,
            bytes: self.bytes,
            last_sequence: self.last_sequence,
            consumers: self.consumers.len(),
        }
    }

    fn enforce_limits(&mut self, now: DateTime<Utc>) {
        if let Some(max_bytes) = self.config.max_bytes {
            while self.bytes > max_bytes {
                match self.messages.pop_first() {
                    Some((_, m)) => self.bytes -= m.payload.len() as u64,
                    None => break,
                }
            }
        }
        let cutoff = self
            .config
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| now.checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            while let Some(entry) = self.messages.first_entry() {
                if entry.get().published >= cutoff {
                    break;
                }
                let m = entry.remove();
                self.bytes -= m.payload.len() as u64;
            }
        }
    }

    /// Interest retention: drop every message no consumer still needs.
    /// Without consumers nothing is retained.
    fn retire_settled(&mut self) {
        if self.config.retention != RetentionPolicy::Interest {
            return;
        }
        let MemStream {
            messages,
            consumers,
            bytes,
            ..
        } = self;
        messages.retain(|seq, m| {
            let keep = consumers.values().any(|c| !c.is_done_with(*seq, &m.subject));
            if !keep {
                *bytes -= m.payload.len() as u64;
            }
            keep
        });
    }

    fn pump(&mut self, durable: &str) {
        let MemStream {
            config,
            messages,
            consumers,
            ..
        } = self;
        if let Some(consumer) = consumers.get_mut(durable) {
            consumer.pump(&config.name, messages);
        }
    }

    fn pump_all(&mut self) {
        let MemStream {
            config,
            messages,
            consumers,
            ..
        } = self;
        for consumer in consumers.values_mut() {
            consumer.pump(&config.name, messages);
        }
    }

    fn consumer_mut(&mut self, durable: &str) -> Result<&mut MemConsumer, BrokerError> {
        let stream = self.config.name.clone();
        self.consumers
            .get_mut(durable)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer {durable} on stream {stream}")))
    }
}

#[derive(Default)]
pub(super) struct LogState {
    streams: BTreeMap<String, MemStream>,
}

impl LogState {
    pub(super) fn names(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    pub(super) fn subscriber_count(&self, stream: &str, durable: &str) -> usize {
        self.streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map_or(0, |c| c.subscribers.len())
    }

    /// Drop every durable subscriber (connection closed).
    pub(super) fn detach_all(&mut self) {
        for stream in self.streams.values_mut() {
            for consumer in stream.consumers.values_mut() {
                let ids: Vec<u64> = consumer.subscribers.iter().map(|s| s.id).collect();
                for id in ids {
                    consumer.detach(id, true);
                }
            }
        }
    }

    fn stream_mut(&mut self, name: &str) -> Result<&mut MemStream, BrokerError> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(format!("stream {name}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ack / subscription control
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct MemoryAcker {
    broker: Weak<Inner>,
    stream: String,
    durable: String,
}

impl MemoryAcker {
    fn settle(&self, sequence: u64, ack: bool) -> Result<(), BrokerError> {
        let inner = self.broker.upgrade().ok_or(BrokerError::Closed)?;
        let mut state = inner.streams.lock();
        let stream = state.stream_mut(&self.stream)?;
        let retention = stream.config.retention;
        let consumer = stream.consumer_mut(&self.durable)?;

        // Settling something that is not pending (double ack, ack after a
        // forced requeue) is a no-op.
        if consumer.pending.remove(&sequence).is_some() {
            if ack {
                consumer.deliveries.remove(&sequence);
                consumer.acked += 1;
                if retention == RetentionPolicy::WorkQueue {
                    if let Some(m) = stream.messages.remove(&sequence) {
                        stream.bytes -= m.payload.len() as u64;
                    }
                }
            } else {
                consumer.redelivery.push_back(sequence);
            }
        }
        stream.pump(&self.durable);
        stream.retire_settled();
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, sequence: u64) -> Result<(), BrokerError> {
        self.settle(sequence, true)
    }

    async fn nak(&self, sequence: u64) -> Result<(), BrokerError> {
        self.settle(sequence, false)
    }
}

struct DurableControl {
    broker: Weak<Inner>,
    stream: String,
    durable: String,
    id: u64,
    cancel: CancellationToken,
}

impl DurableControl {
    fn detach(&self, requeue: bool) {
        let Some(inner) = self.broker.upgrade() else {
            return;
        };
        let mut state = inner.streams.lock();
        if let Ok(stream) = state.stream_mut(&self.stream) {
            if let Ok(consumer) = stream.consumer_mut(&self.durable) {
                consumer.detach(self.id, requeue);
            }
            stream.pump(&self.durable);
        }
    }
}

#[async_trait]
impl SubscriptionControl for DurableControl {
    async fn drain(&self) -> Result<(), BrokerError> {
        // Buffered deliveries stay pending; the consumer task settles them
        // before its stream ends.
        self.detach(false);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        self.detach(true);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LogBroker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl LogBroker for MemoryBroker {
    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BrokerError> {
        self.ensure_open()?;
        let mut state = self.inner.streams.lock();
        Ok(state.stream_mut(name)?.info())
    }

    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError> {
        self.ensure_open()?;
        if config.subjects.is_empty() {
            return Err(BrokerError::Other(format!(
                "stream {} must capture at least one subject",
                config.name
            )));
        }
        if let Some(bad) = config.subjects.iter().find(|s| !is_valid_pattern(s)) {
            return Err(BrokerError::InvalidSubject(bad.clone()));
        }

        let mut state = self.inner.streams.lock();
        if state.streams.contains_key(&config.name) {
            return Err(BrokerError::AlreadyExists(format!("stream {}", config.name)));
        }
        for (name, existing) in &state.streams {
            let overlaps = existing.config.subjects.iter().any(|a| {
                config
                    .subjects
                    .iter()
                    .any(|b| subject_matches(a, b) || subject_matches(b, a))
            });
            if overlaps {
                return Err(BrokerError::Other(format!(
                    "subjects of stream {} overlap with stream {name}",
                    config.name
                )));
            }
        }

        let stream = MemStream {
            config,
            created: Utc::now(),
            messages: BTreeMap::new(),
            last_sequence: 0,
            bytes: 0,
            consumers: BTreeMap::new(),
        };
        let info = stream.info();
        tracing::debug!(stream = %info.config.name, subjects = ?info.config.subjects, "stream created");
        state.streams.insert(info.config.name.clone(), stream);
        Ok(info)
    }

    async fn publish_to_log(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply: Option<&str>,
    ) -> Result<PublishAck, BrokerError> {
        self.ensure_open()?;
        if !is_valid_publish_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }

        let now = Utc::now();
        let (ack, no_ack) = {
            let mut state = self.inner.streams.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.captures(subject))
                .ok_or_else(|| BrokerError::NotFound(format!("no stream captures subject {subject}")))?;

            stream.last_sequence += 1;
            let sequence = stream.last_sequence;
            stream.bytes += payload.len() as u64;
            stream.messages.insert(
                sequence,
                Stored {
                    subject: subject.to_string(),
                    payload,
                    reply: reply.map(str::to_string),
                    published: now,
                },
            );
            stream.enforce_limits(now);
            stream.pump_all();
            stream.retire_settled();

            (
                PublishAck {
                    stream: stream.config.name.clone(),
                    sequence,
                },
                stream.config.no_ack,
            )
        };

        // Without `no_ack` the stream answers the publisher on its reply
        // address, exactly like a server-side stream would.
        if !no_ack {
            if let Some(reply) = reply {
                let body = serde_json::to_vec(&ack).map_err(|e| BrokerError::Other(e.to_string()))?;
                self.route(&Message::new(reply, body, None));
            }
        }

        Ok(ack)
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<ConsumerInfo, BrokerError> {
        self.ensure_open()?;
        let mut state = self.inner.streams.lock();
        let stream = state.stream_mut(stream)?;
        let consumer = stream
            .consumers
            .get(durable)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer {durable} on stream {}", stream.config.name)))?;
        Ok(consumer.info(&stream.config.name, &stream.messages))
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError> {
        self.ensure_open()?;
        let mut state = self.inner.streams.lock();
        let s = state.stream_mut(stream)?;
        if s.consumers.contains_key(&config.durable_name) {
            return Err(BrokerError::AlreadyExists(format!(
                "consumer {} on stream {stream}",
                config.durable_name
            )));
        }

        let acker: Arc<dyn Acker> = Arc::new(MemoryAcker {
            broker: Arc::downgrade(&self.inner),
            stream: stream.to_string(),
            durable: config.durable_name.clone(),
        });
        let durable = config.durable_name.clone();
        let consumer = MemConsumer {
            config,
            acker,
            next_sequence: 1,
            redelivery: VecDeque::new(),
            pending: HashMap::new(),
            deliveries: HashMap::new(),
            subscribers: Vec::new(),
            bound_queue: None,
            rr: 0,
            delivered: 0,
            acked: 0,
            terminated: 0,
        };
        let info = consumer.info(stream, &s.messages);
        s.consumers.insert(durable.clone(), consumer);
        tracing::debug!(stream, durable = %durable, "durable consumer created");
        Ok(info)
    }

    async fn subscribe_durable(
        &self,
        stream: &str,
        durable: &str,
        queue: Option<&str>,
    ) -> Result<LogSubscription, BrokerError> {
        self.ensure_open()?;
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let label = {
            let mut state = self.inner.streams.lock();
            let s = state.stream_mut(stream)?;
            let consumer = s.consumer_mut(durable)?;

            if let Some(group) = &consumer.config.deliver_group {
                if queue != Some(group.as_str()) {
                    return Err(BrokerError::Other(format!(
                        "consumer {durable} requires queue group {group}"
                    )));
                }
            }
            if !consumer.subscribers.is_empty() {
                let same_group = matches!(
                    (consumer.bound_queue.as_deref(), queue),
                    (Some(bound), Some(q)) if bound == q
                );
                if !same_group {
                    return Err(BrokerError::Other(format!(
                        "durable consumer {durable} is already bound"
                    )));
                }
            }

            consumer.bound_queue = queue.map(str::to_string);
            consumer.subscribers.push(DurableSub { id, tx });
            let label = consumer
                .config
                .filter_subject
                .clone()
                .unwrap_or_else(|| stream.to_string());
            s.pump(durable);
            label
        };
        tracing::trace!(id, stream, durable, queue = ?queue, "durable subscriber attached");

        let control = Arc::new(DurableControl {
            broker: Arc::downgrade(&self.inner),
            stream: stream.to_string(),
            durable: durable.to_string(),
            id,
            cancel: cancel.clone(),
        });
        Ok(LogSubscription::new(
            SubscriptionHandle::new(id, &label, control),
            channel_stream(rx, cancel),
        ))
    }
}
