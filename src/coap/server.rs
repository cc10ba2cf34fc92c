//! Observers are tied to a peer that may vanish without a word, so each one
//! is checked for liveness: after `keepalive` without a confirmed exchange
//! the next notification goes out confirmable, and an observer with no
//! traffic at all is pinged. A confirmable message that is never
//! acknowledged, after `MAX_RETRANSMIT` retransmissions with a doubling
//! timeout, cancels the observer.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::message::{CONTENT_FORMAT, CoapMessage, Code, MessageType, OBSERVE, encode_uint};
use super::{code_for, content_format_for, content_type_for};
use crate::adapter::{Adapter, Inbound};
use crate::client::{Client, EgressQueue};
use crate::messaging::Message;
use crate::messaging::topic::{parse_channel_path, parse_subscribe_subtopic};
use crate::server::{SessionGuard, Shutdown, Signal};

const MAX_DATAGRAM: usize = 64 * 1024;
const AUTH_QUERY: &str = "auth";
const OBSERVE_MASK: u32 = 0x00FF_FFFF;
/// Notification message ids a RST may still refer to.
const RECENT_MIDS: usize = 8;
const MAX_RETRANSMIT: u32 = 4;
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

type ObserverKey = (SocketAddr, Vec<u8>);
type RecentMids = Arc<Mutex<VecDeque<u16>>>;

struct Observer {
    client: Client,
    recent: RecentMids,
    _guard: SessionGuard,
}

/// Observe value following `sequence`, wrapping at 2^24.
pub(super) fn next_observe(sequence: u32) -> u32 {
    sequence.wrapping_add(1) & OBSERVE_MASK
}

fn remember(recent: &RecentMids, mid: u16) {
    let mut recent = recent.lock();
    if recent.len() == RECENT_MIDS {
        recent.pop_front();
    }
    recent.push_back(mid);
}

/// UDP endpoint serving publishes and observe registrations.
pub struct CoapServer {
    adapter: Adapter,
    socket: Arc<UdpSocket>,
    observers: RwLock<HashMap<ObserverKey, Observer>>,
    queue_depth: usize,
    shutdown: Arc<Shutdown>,
    next_mid: AtomicU16,
    /// Confirmable messages awaiting an ACK (or a RST answering a ping).
    pending: Mutex<HashMap<(SocketAddr, u16), oneshot::Sender<()>>>,
    keepalive: Duration,
    ack_timeout: Duration,
}

impl CoapServer {
    pub fn new(adapter: Adapter, socket: UdpSocket, queue_depth: usize, shutdown: Arc<Shutdown>) -> Self {
        let seed = uuid::Uuid::new_v4().as_u128() as u16;
        Self {
            adapter,
            socket: Arc::new(socket),
            observers: RwLock::new(HashMap::new()),
            queue_depth,
            shutdown,
            next_mid: AtomicU16::new(seed),
            pending: Mutex::new(HashMap::new()),
            keepalive: DEFAULT_KEEPALIVE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_keepalive(mut self, keepalive: Duration, ack_timeout: Duration) -> Self {
        self.keepalive = keepalive;
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Receive datagrams until shutdown, then cancel every observer.
    pub async fn serve(self: Arc<Self>, mut signal: Signal) -> std::io::Result<()> {
        info!(addr = %self.socket.local_addr()?, "CoAP server listening");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    match CoapMessage::decode(&buf[..len]) {
                        Ok(msg) => self.dispatch(msg, peer).await,
                        Err(e) => debug!(%peer, error = %e, "dropping undecodable datagram"),
                    }
                }
            }
        }
        self.cancel_all().await;
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, msg: CoapMessage, peer: SocketAddr) {
        match msg.mtype {
            MessageType::Reset => self.reset(peer, msg.message_id).await,
            MessageType::Acknowledgement => self.acknowledge(peer, msg.message_id),
            MessageType::Confirmable if msg.code == Code::EMPTY => {
                // CoAP ping
                let pong = CoapMessage::new(MessageType::Reset, Code::EMPTY, msg.message_id);
                self.send(&pong, peer).await;
            }
            _ if msg.code.is_request() => {
                let server = self.clone();
                tokio::spawn(async move {
                    let response = server.handle_request(&msg, peer).await;
                    server.send(&response, peer).await;
                });
            }
            _ => debug!(%peer, code = %msg.code, "ignoring non-request message"),
        }
    }

    async fn send(&self, msg: &CoapMessage, peer: SocketAddr) {
        match msg.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, peer).await {
                    warn!(%peer, error = %e, "failed to send CoAP message");
                }
            }
            Err(e) => warn!(%peer, error = %e, "failed to encode CoAP message"),
        }
    }

    fn next_message_id(&self) -> u16 {
        self.next_mid.fetch_add(1, Ordering::Relaxed)
    }

    /// Process one request and build the single response it gets.
    pub async fn handle_request(self: &Arc<Self>, req: &CoapMessage, peer: SocketAddr) -> CoapMessage {
        let mut response = match req.mtype {
            MessageType::Confirmable => {
                CoapMessage::new(MessageType::Acknowledgement, Code::CONTENT, req.message_id)
            }
            _ => CoapMessage::new(MessageType::NonConfirmable, Code::CONTENT, self.next_message_id()),
        }
        .with_token(&req.token);

        let code = match req.code {
            Code::POST => self.publish(req).await,
            Code::GET => match req.observe() {
                None | Some(Err(_)) => Code::BAD_OPTION,
                Some(Ok(0)) => match self.register(req, peer).await {
                    Ok(()) => {
                        response.set_uint_option(OBSERVE, 0);
                        Code::CONTENT
                    }
                    Err(code) => code,
                },
                Some(Ok(_)) => self.deregister(req, peer).await,
            },
            _ => Code::NOT_FOUND,
        };
        response.code = code;
        debug!(%peer, method = %req.code, path = %req.path(), code = %response.code, "CoAP request handled");
        response
    }

    async fn publish(&self, req: &CoapMessage) -> Code {
        let Ok((channel, subtopic)) = parse_channel_path(&req.path()) else {
            return Code::NOT_FOUND;
        };
        let content_type = match req.content_format() {
            Some(Ok(format)) => content_type_for(format),
            Some(Err(_)) => return Code::BAD_OPTION,
            None => "",
        };
        let inbound = Inbound {
            channel,
            subtopic,
            key: req.query(AUTH_QUERY),
            payload: req.payload.clone(),
            content_type: content_type.to_string(),
        };
        match self.adapter.publish(inbound).await {
            Ok(_) => Code::CREATED,
            Err(e) => {
                debug!(error = %e, "CoAP publish rejected");
                code_for(e.kind())
            }
        }
    }

    async fn register(self: &Arc<Self>, req: &CoapMessage, peer: SocketAddr) -> Result<(), Code> {
        let (channel, raw) = parse_channel_path(&req.path()).map_err(|_| Code::NOT_FOUND)?;
        let subtopic = parse_subscribe_subtopic(&raw).map_err(|_| Code::BAD_REQUEST)?;
        let key = req.query(AUTH_QUERY);
        let publisher = self
            .adapter
            .authorize(&channel, key.as_deref())
            .await
            .map_err(|e| code_for(e.kind()))?;
        let guard = self.shutdown.session().ok_or(Code::INTERNAL_SERVER_ERROR)?;

        let observer_key = (peer, req.token.clone());
        self.cancel(&observer_key).await;

        let queue = Arc::new(EgressQueue::new(self.queue_depth, "coap"));
        let client = Client::new(channel, subtopic, publisher, queue.clone());
        self.adapter
            .subscribe(&client, false)
            .await
            .map_err(|e| code_for(e.kind()))?;

        let recent: RecentMids = Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_MIDS)));
        tokio::spawn(self.clone().notify_loop(observer_key.clone(), queue, recent.clone()));

        info!(%peer, client = %client.id, topic = %client.topic(), "CoAP observer registered");
        self.observers.write().insert(
            observer_key,
            Observer {
                client,
                recent,
                _guard: guard,
            },
        );
        Ok(())
    }

    async fn deregister(&self, req: &CoapMessage, peer: SocketAddr) -> Code {
        let Ok((channel, _)) = parse_channel_path(&req.path()) else {
            return Code::NOT_FOUND;
        };
        if let Err(e) = self.adapter.authorize(&channel, req.query(AUTH_QUERY).as_deref()).await {
            return code_for(e.kind());
        }
        if !self.cancel(&(peer, req.token.clone())).await {
            debug!(%peer, "deregister for unknown observer");
        }
        Code::CONTENT
    }

    /// A RST answering one of the recent notifications cancels that
    /// observer. Any other RST for a pending exchange answers a ping.
    async fn reset(&self, peer: SocketAddr, message_id: u16) {
        let waiter = self.pending.lock().remove(&(peer, message_id));
        let key = self
            .observers
            .read()
            .iter()
            .find(|((addr, _), obs)| *addr == peer && obs.recent.lock().contains(&message_id))
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => {
                drop(waiter);
                debug!(%peer, message_id, "observer reset by client");
                self.cancel(&key).await;
            }
            None => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
            }
        }
    }

    fn acknowledge(&self, peer: SocketAddr, message_id: u16) {
        let waiter = self.pending.lock().remove(&(peer, message_id));
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
    }

    /// Remove an observer and end its broker subscription. Returns whether
    /// one was registered.
    async fn cancel(&self, key: &ObserverKey) -> bool {
        let removed = self.observers.write().remove(key);
        self.release(removed).await
    }

    /// Cancel the observer at `key` only if it is still the one fed by
    /// `queue`; a re-registration under the same key must survive.
    async fn expire(&self, key: &ObserverKey, queue: &Arc<EgressQueue<Message>>) {
        let removed = {
            let mut observers = self.observers.write();
            match observers.get(key) {
                Some(obs) if Arc::ptr_eq(&obs.client.queue, queue) => observers.remove(key),
                _ => None,
            }
        };
        self.release(removed).await;
    }

    async fn release(&self, removed: Option<Observer>) -> bool {
        let Some(observer) = removed else {
            return false;
        };
        if let Err(e) = self.adapter.unsubscribe(&observer.client).await {
            warn!(client = %observer.client.id, error = %e, "unsubscribe failed");
        }
        observer.client.queue.close();
        true
    }

    async fn cancel_all(&self) {
        let keys: Vec<ObserverKey> = self.observers.read().keys().cloned().collect();
        for key in keys {
            self.cancel(&key).await;
        }
    }

    /// Send a confirmable message and wait for its acknowledgement,
    /// retransmitting with a doubling timeout.
    async fn confirm(&self, msg: &CoapMessage, peer: SocketAddr) -> bool {
        let exchange = (peer, msg.message_id);
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(exchange, tx);

        let mut wait = self.ack_timeout;
        let mut answered = false;
        for attempt in 0..=MAX_RETRANSMIT {
            self.send(msg, peer).await;
            match tokio::time::timeout(wait, &mut rx).await {
                Ok(Ok(())) => {
                    answered = true;
                    break;
                }
                // exchange dropped by a reset
                Ok(Err(_)) => break,
                Err(_) => {
                    debug!(%peer, message_id = msg.message_id, attempt, "confirmable message not acknowledged");
                    wait *= 2;
                }
            }
        }
        self.pending.lock().remove(&exchange);
        answered
    }

    /// Drain an observer's queue into notifications carrying a growing
    /// Observe sequence number, checking now and then that the peer is
    /// still listening.
    async fn notify_loop(
        self: Arc<Self>,
        key: ObserverKey,
        queue: Arc<EgressQueue<Message>>,
        recent: RecentMids,
    ) {
        let peer = key.0;
        let mut sequence: u32 = 0;
        let mut confirmed_at = Instant::now();
        loop {
            let exchange = match tokio::time::timeout(self.keepalive, queue.pop()).await {
                Ok(None) => break,
                Ok(Some(msg)) => {
                    sequence = next_observe(sequence);
                    let mtype = if confirmed_at.elapsed() >= self.keepalive {
                        MessageType::Confirmable
                    } else {
                        MessageType::NonConfirmable
                    };
                    let mid = self.next_message_id();
                    let notification = CoapMessage::new(mtype, Code::CONTENT, mid)
                        .with_token(&key.1)
                        .with_option(OBSERVE, encode_uint(sequence))
                        .with_option(CONTENT_FORMAT, encode_uint(content_format_for(&msg.content_type)))
                        .with_payload(msg.payload);
                    remember(&recent, mid);
                    if mtype == MessageType::NonConfirmable {
                        self.send(&notification, peer).await;
                        continue;
                    }
                    notification
                }
                // idle: ping
                Err(_) => CoapMessage::new(MessageType::Confirmable, Code::EMPTY, self.next_message_id()),
            };

            if self.confirm(&exchange, peer).await {
                confirmed_at = Instant::now();
            } else if queue.is_closed() {
                break;
            } else {
                info!(%peer, "observer stopped answering, cancelling");
                self.expire(&key, &queue).await;
                break;
            }
        }
        debug!(%peer, "observer notifications stopped");
    }
}
