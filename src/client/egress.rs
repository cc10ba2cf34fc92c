use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::utils::metrics::DROPPED_MESSAGES;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded single-consumer queue between a broker handler and a socket
/// writer.
///
/// `push` never waits: when the queue is full the oldest item is evicted and
/// counted under `dropped_messages_total{protocol}`.
pub struct EgressQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    depth: usize,
    protocol: &'static str,
    dropped: AtomicU64,
}

impl<T> EgressQueue<T> {
    pub fn new(depth: usize, protocol: &'static str) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(depth),
                closed: false,
            }),
            notify: Notify::new(),
            depth: depth.max(1),
            protocol,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `item`. Returns `false` once the queue is closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            if state.items.len() >= self.depth {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(DROPPED_MESSAGES, "protocol" => self.protocol).increment(1);
                debug!(protocol = self.protocol, "egress queue full, dropped oldest");
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next item. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting items and wake the consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
