//! Outbound spill buffer.
//!
//! `SpillPublisher` wraps any publisher. When the inner publisher reports
//! `Unavailable`, the envelope is parked in a bounded, process-local queue
//! and the caller still receives the error. On overflow the oldest parked
//! envelope is evicted and counted. Nothing here is durable.
//!
//! While anything is parked, later publishes queue behind it so a topic's
//! envelopes reach the broker in the order they were published.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::message::Message;
use super::pubsub::{BrokerError, Publisher, Subscriber, SubscriberConfig};
use crate::server::Signal;
use crate::utils::metrics::SPILL_DROPPED;

pub struct SpillPublisher<P> {
    inner: P,
    capacity: usize,
    buffer: Mutex<VecDeque<(String, Message)>>,
    dropped: AtomicU64,
    /// Held by whoever is publishing, so a replay and a fresh publish never
    /// interleave.
    order: tokio::sync::Mutex<()>,
}

impl<P> SpillPublisher<P> {
    pub fn new(inner: P, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            buffer: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            order: tokio::sync::Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Envelopes waiting for the broker to come back.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Envelopes evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn spill(&self, topic: &str, msg: &Message) {
        if self.capacity == 0 {
            return;
        }
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(SPILL_DROPPED).increment(1);
        }
        buffer.push_back((topic.to_string(), msg.clone()));
    }
}

impl<P: Publisher> SpillPublisher<P> {
    /// Replay parked envelopes in order. Stops at the first failure, leaving
    /// that envelope at the head. Returns how many were delivered.
    pub async fn flush(&self) -> usize {
        let _order = self.order.lock().await;
        self.drain().await
    }

    async fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Some((topic, msg)) = self.buffer.lock().pop_front() else {
                break;
            };
            match self.inner.publish(&topic, &msg).await {
                Ok(()) => delivered += 1,
                Err(BrokerError::Unavailable(reason)) => {
                    debug!(%reason, "broker still unavailable, keeping spill buffer");
                    self.buffer.lock().push_front((topic, msg));
                    break;
                }
                Err(e) => warn!(%topic, error = %e, "discarding spilled envelope"),
            }
        }
        delivered
    }
}

impl<P: Publisher + 'static> SpillPublisher<P> {
    /// Periodically flush until shutdown.
    pub async fn run_flush_loop(self: Arc<Self>, every: Duration, mut signal: Signal) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = ticker.tick() => {
                    if self.pending() > 0 {
                        let delivered = self.flush().await;
                        if delivered > 0 {
                            info!(delivered, "replayed spilled envelopes");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<P: Publisher> Publisher for SpillPublisher<P> {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), BrokerError> {
        let _order = self.order.lock().await;
        if self.pending() > 0 {
            self.drain().await;
            if self.pending() > 0 {
                self.spill(topic, msg);
                return Err(BrokerError::Unavailable(
                    "earlier envelopes still waiting for the broker".to_string(),
                ));
            }
        }
        match self.inner.publish(topic, msg).await {
            Err(BrokerError::Unavailable(reason)) => {
                self.spill(topic, msg);
                Err(BrokerError::Unavailable(reason))
            }
            other => other,
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

#[async_trait]
impl<P: Subscriber> Subscriber for SpillPublisher<P> {
    async fn subscribe(&self, cfg: SubscriberConfig) -> Result<(), BrokerError> {
        self.inner.subscribe(cfg).await
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), BrokerError> {
        self.inner.unsubscribe(id, topic).await
    }
}
