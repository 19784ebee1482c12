//! Core subject routing for the memory broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Inner;
use crate::error::BrokerError;
use crate::message::Message;
use crate::pattern::subject_matches;
use crate::subscription::SubscriptionControl;

pub(super) struct CoreSub {
    pub(super) pattern: String,
    pub(super) queue: Option<String>,
    pub(super) tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
pub(super) struct PubSubState {
    subs: BTreeMap<u64, CoreSub>,
    /// Round-robin position per queue group with at least one member.
    queue_cursors: HashMap<String, usize>,
}

impl PubSubState {
    pub(super) fn insert(&mut self, id: u64, sub: CoreSub) {
        self.subs.insert(id, sub);
    }

    pub(super) fn remove(&mut self, id: u64) -> bool {
        let Some(sub) = self.subs.remove(&id) else {
            return false;
        };
        if let Some(queue) = sub.queue {
            if !self.subs.values().any(|s| s.queue.as_ref() == Some(&queue)) {
                self.queue_cursors.remove(&queue);
            }
        }
        true
    }

    pub(super) fn len(&self) -> usize {
        self.subs.len()
    }

    pub(super) fn cursor_count(&self) -> usize {
        self.queue_cursors.len()
    }

    pub(super) fn patterns(&self) -> impl Iterator<Item = &str> {
        self.subs.values().map(|s| s.pattern.as_str())
    }

    /// Drop every subscription; returns how many there were.
    pub(super) fn clear(&mut self) -> usize {
        let n = self.subs.len();
        self.subs.clear();
        self.queue_cursors.clear();
        n
    }

    /// Deliver to every plain subscriber and to one member of each queue
    /// group.  Subscribers whose receiving side is gone are pruned.
    pub(super) fn route(&mut self, msg: &Message) -> usize {
        let mut targets = Vec::new();
        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (id, sub) in &self.subs {
            if !subject_matches(&sub.pattern, &msg.subject) {
                continue;
            }
            match &sub.queue {
                None => targets.push(*id),
                Some(queue) => groups.entry(queue.clone()).or_default().push(*id),
            }
        }

        for (queue, members) in groups {
            let cursor = self.queue_cursors.entry(queue).or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor = cursor.wrapping_add(1);
        }

        let mut delivered = 0;
        for id in targets {
            let sent = self
                .subs
                .get(&id)
                .map(|sub| sub.tx.send(msg.clone()).is_ok())
                .unwrap_or(false);
            if sent {
                delivered += 1;
            } else {
                self.remove(id);
            }
        }
        delivered
    }
}

/// Control half of a core subscription.
pub(super) struct CoreControl {
    broker: Weak<Inner>,
    id: u64,
    cancel: CancellationToken,
}

impl CoreControl {
    pub(super) fn new(broker: Weak<Inner>, id: u64, cancel: CancellationToken) -> Self {
        Self { broker, id, cancel }
    }

    fn detach(&self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.pubsub.lock().remove(self.id);
        }
    }
}

#[async_trait]
impl SubscriptionControl for CoreControl {
    async fn drain(&self) -> Result<(), BrokerError> {
        // Removing the entry drops the sender; the receiver yields what is
        // buffered and then ends.
        self.detach();
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        self.detach();
        Ok(())
    }
}
