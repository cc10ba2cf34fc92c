//! Broker engine
//!
//! In-process implementation of the `PubSub` contract. It is what
//! `BROKER_URL=memory://` selects and what the adapter tests run against.
//!
//! Responsibilities:
//! - matching published subjects against subscription patterns (`*`, `>`)
//! - delivering encoded envelopes to one dispatcher task per subscription,
//!   which decodes and invokes the handler sequentially
//! - queue groups: one member per group receives each envelope, picked
//!   round-robin
//! - replacing a re-subscribed `(id, topic)` only after the previous
//!   handler's `cancel` has run
//!
//! Concurrency notes:
//! - The subscription table sits behind a `parking_lot::RwLock` that is
//!   never held across an await. Subscribe and unsubscribe are serialized
//!   by a separate async lock so teardown can await in-flight handlers.
//! - Each subscription's handler lives behind an async mutex that the
//!   dispatcher holds while invoking it. Teardown takes the handler out
//!   under the same mutex, so once `unsubscribe` returns no invocation can
//!   start.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::codec;
use super::message::Message;
use super::pubsub::{
    BrokerError, MessageHandler, Publisher, Subscriber, SubscriberConfig, validate_publish,
    validate_subscription,
};
use super::topic::{channel_subject, matches};

type SubscriptionKey = (String, String);
type HandlerSlot = Arc<Mutex<Option<Arc<dyn MessageHandler>>>>;

struct Subscription {
    queue: Option<String>,
    sender: mpsc::UnboundedSender<Bytes>,
    handler: HandlerSlot,
}

impl Subscription {
    /// Take the handler out and cancel it. Waits for an in-flight
    /// invocation to finish first.
    async fn teardown(self) {
        let mut slot = self.handler.lock().await;
        if let Some(handler) = slot.take() {
            handler.cancel();
        }
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    subscriptions: RwLock<HashMap<SubscriptionKey, Subscription>>,
    ops: Mutex<()>,
    closed: AtomicBool,
    round_robin: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_subscribed(&self, id: &str, topic: &str) -> bool {
        self.subscriptions
            .read()
            .contains_key(&(id.to_string(), topic.to_string()))
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker connection closed".to_string()));
        }
        Ok(())
    }

    /// Pick recipients for `subject`: every plain subscriber plus one member
    /// of each matching queue group.
    fn recipients(&self, subject: &str) -> Vec<mpsc::UnboundedSender<Bytes>> {
        let subs = self.subscriptions.read();
        let mut direct = Vec::new();
        let mut groups: BTreeMap<&str, Vec<(&SubscriptionKey, &Subscription)>> = BTreeMap::new();

        for (key, sub) in subs.iter() {
            if !matches(&key.1, subject) {
                continue;
            }
            match sub.queue.as_deref() {
                Some(queue) => groups.entry(queue).or_default().push((key, sub)),
                None => direct.push(sub.sender.clone()),
            }
        }

        let turn = self.round_robin.fetch_add(1, Ordering::Relaxed);
        for members in groups.values_mut() {
            members.sort_by(|a, b| a.0.cmp(b.0));
            let (_, chosen) = members[turn % members.len()];
            direct.push(chosen.sender.clone());
        }
        direct
    }
}

async fn dispatch(
    id: String,
    topic: String,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
    slot: HandlerSlot,
) {
    while let Some(frame) = receiver.recv().await {
        let msg = match codec::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(subscriber = %id, %topic, error = %e, "dropping undecodable envelope");
                continue;
            }
        };

        let guard = slot.lock().await;
        let Some(handler) = guard.as_ref() else {
            break;
        };
        if let Err(e) = handler.handle(&msg).await {
            warn!(subscriber = %id, %topic, error = %e, "handler failed");
        }
    }
    debug!(subscriber = %id, %topic, "dispatcher stopped");
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), BrokerError> {
        self.ensure_open()?;
        validate_publish(topic, msg)?;

        let subject = channel_subject(topic, &msg.subtopic);
        let frame = codec::encode(msg)?;
        for sender in self.recipients(&subject) {
            // A closed receiver means the subscription is being torn down.
            let _ = sender.send(frame.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let _ops = self.ops.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Subscription> = self
            .subscriptions
            .write()
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in drained {
            sub.teardown().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(&self, cfg: SubscriberConfig) -> Result<(), BrokerError> {
        validate_subscription(&cfg.id, &cfg.topic)?;
        let _ops = self.ops.lock().await;
        self.ensure_open()?;

        let key = (cfg.id.clone(), cfg.topic.clone());
        let previous = {
            let mut subs = self.subscriptions.write();
            if let Some(existing) = subs.get(&key) {
                if existing.queue != cfg.queue {
                    return Err(BrokerError::AlreadySubscribed {
                        id: cfg.id,
                        topic: cfg.topic,
                    });
                }
            }
            subs.remove(&key)
        };
        if let Some(previous) = previous {
            previous.teardown().await;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let slot: HandlerSlot = Arc::new(Mutex::new(Some(cfg.handler)));
        tokio::spawn(dispatch(
            cfg.id.clone(),
            cfg.topic.clone(),
            receiver,
            slot.clone(),
        ));

        self.subscriptions.write().insert(
            key,
            Subscription {
                queue: cfg.queue,
                sender,
                handler: slot,
            },
        );
        Ok(())
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), BrokerError> {
        validate_subscription(id, topic)?;
        let _ops = self.ops.lock().await;

        let removed = self
            .subscriptions
            .write()
            .remove(&(id.to_string(), topic.to_string()));
        match removed {
            Some(sub) => {
                sub.teardown().await;
                Ok(())
            }
            None => Err(BrokerError::NotSubscribed),
        }
    }
}
