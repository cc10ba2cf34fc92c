//! Logging and metrics wrappers around any `PubSub`.
//!
//! Each wrapper is a plain value implementing the same traits as what it
//! wraps, so they stack: `Logging::new(Metrics::new(broker))`.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::message::Message;
use super::pubsub::{BrokerError, Publisher, Subscriber, SubscriberConfig};
use crate::utils::metrics::{BROKER_LATENCY, BROKER_REQUESTS};

pub struct Logging<P> {
    inner: P,
}

impl<P> Logging<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: Publisher> Publisher for Logging<P> {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), BrokerError> {
        let started = Instant::now();
        let result = self.inner.publish(topic, msg).await;
        match &result {
            Ok(()) => debug!(
                channel = %topic,
                subtopic = %msg.subtopic,
                protocol = %msg.protocol,
                took = ?started.elapsed(),
                "published"
            ),
            Err(e) => warn!(channel = %topic, error = %e, took = ?started.elapsed(), "publish failed"),
        }
        result
    }

    async fn close(&self) -> Result<(), BrokerError> {
        info!("closing broker connection");
        self.inner.close().await
    }
}

#[async_trait]
impl<P: Subscriber> Subscriber for Logging<P> {
    async fn subscribe(&self, cfg: SubscriberConfig) -> Result<(), BrokerError> {
        let (id, topic) = (cfg.id.clone(), cfg.topic.clone());
        let result = self.inner.subscribe(cfg).await;
        match &result {
            Ok(()) => debug!(subscriber = %id, %topic, "subscribed"),
            Err(e) => warn!(subscriber = %id, %topic, error = %e, "subscribe failed"),
        }
        result
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), BrokerError> {
        let result = self.inner.unsubscribe(id, topic).await;
        match &result {
            Ok(()) => debug!(subscriber = %id, %topic, "unsubscribed"),
            Err(e) => debug!(subscriber = %id, %topic, error = %e, "unsubscribe failed"),
        }
        result
    }
}

pub struct Metrics<P> {
    inner: P,
}

impl<P> Metrics<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

fn observe(method: &'static str, started: Instant, result: &Result<(), BrokerError>) {
    let outcome = match result {
        Ok(()) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(BROKER_REQUESTS, "method" => method, "outcome" => outcome).increment(1);
    metrics::histogram!(BROKER_LATENCY, "method" => method)
        .record(started.elapsed().as_secs_f64());
}

#[async_trait]
impl<P: Publisher> Publisher for Metrics<P> {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), BrokerError> {
        let started = Instant::now();
        let result = self.inner.publish(topic, msg).await;
        observe("publish", started, &result);
        result
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

#[async_trait]
impl<P: Subscriber> Subscriber for Metrics<P> {
    async fn subscribe(&self, cfg: SubscriberConfig) -> Result<(), BrokerError> {
        let started = Instant::now();
        let result = self.inner.subscribe(cfg).await;
        observe("subscribe", started, &result);
        result
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), BrokerError> {
        let started = Instant::now();
        let result = self.inner.unsubscribe(id, topic).await;
        observe("unsubscribe", started, &result);
        result
    }
}
