//! Graceful shutdown coordinator
//!
//! Once `trigger` runs, listeners stop accepting, every session observes its
//! `Signal` at the next suspension point and tears itself down, and `drain`
//! waits for the live session count to reach zero. Whatever is still running
//! after the drain window is left to be aborted by the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_DRAIN_SECS: u64 = 30;

pub struct Shutdown {
    tx: watch::Sender<bool>,
    active_sessions: AtomicU64,
    drained: Notify,
    drain_window: Duration,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DRAIN_SECS))
    }
}

impl Shutdown {
    pub fn new(drain_window: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            active_sessions: AtomicU64::new(0),
            drained: Notify::new(),
            drain_window,
        }
    }

    /// Start shutting down. Idempotent.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!(
                sessions = self.active_sessions(),
                "shutdown initiated"
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> Signal {
        Signal(self.tx.subscribe())
    }

    /// Register a live session. Returns `None` once shutdown has started.
    pub fn session(self: &Arc<Self>) -> Option<SessionGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        Some(SessionGuard {
            owner: self.clone(),
        })
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Wait for every session to finish, bounded by the drain window.
    /// Returns `false` if sessions were still live when the window closed.
    pub async fn drain(&self) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_sessions() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(self.drain_window, wait).await {
            Ok(()) => {
                debug!("all sessions drained");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.active_sessions(),
                    window = ?self.drain_window,
                    "drain window elapsed, terminating remaining sessions"
                );
                false
            }
        }
    }
}

/// Keeps a session counted until dropped.
pub struct SessionGuard {
    owner: Arc<Shutdown>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.owner.active_sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.owner.drained.notify_waiters();
        }
    }
}

/// Shutdown notification handed to listeners and sessions.
#[derive(Clone)]
pub struct Signal(watch::Receiver<bool>);

impl Signal {
    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&mut self) {
        // A dropped coordinator counts as shutdown.
        let _ = self.0.wait_for(|down| *down).await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}
