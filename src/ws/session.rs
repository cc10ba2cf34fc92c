//! Per-connection session.
//!
//! The owner task runs the reader inline and a writer task beside it. The
//! writer drains the client's egress queue into the socket; the socket sink
//! sits behind a mutex so the owner can still send the final close frame.
//! Whichever of {socket closed, writer failed, publish failed, shutdown}
//! happens first ends the session, and teardown runs exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::table::{SessionInfo, SessionTable};
use super::{CLOSE_GOING_AWAY, close_code_for};
use crate::adapter::{Adapter, Inbound};
use crate::client::{Client, EgressQueue};
use crate::messaging::Message;
use crate::messaging::message::now_nanos;
use crate::server::{SessionGuard, Signal};
use crate::utils::error::ErrorKind;

type SharedSink = Arc<Mutex<SplitSink<WebSocket, WsMessage>>>;

pub(super) struct Session {
    pub adapter: Adapter,
    pub client: Client,
    pub key: String,
    /// Subtopic exactly as requested, reused for every publish.
    pub raw_subtopic: String,
    pub sessions: Arc<SessionTable>,
    pub signal: Signal,
    pub closed: AtomicBool,
    pub _guard: SessionGuard,
}

fn encode(msg: &Message) -> WsMessage {
    match std::str::from_utf8(&msg.payload) {
        Ok(text) => WsMessage::Text(text.to_owned().into()),
        Err(_) => WsMessage::Binary(msg.payload.clone().into()),
    }
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }
}

async fn write_loop(sink: SharedSink, queue: Arc<EgressQueue<Message>>, id: String) {
    while let Some(msg) = queue.pop().await {
        if let Err(e) = sink.lock().await.send(encode(&msg)).await {
            debug!(client = %id, error = %e, "websocket write failed");
            break;
        }
    }
}

impl Session {
    pub async fn run(self, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let sink: SharedSink = Arc::new(Mutex::new(sink));

        if let Err(e) = self.adapter.subscribe(&self.client, true).await {
            warn!(client = %self.client.id, error = %e, "subscribe failed");
            let frame = close_frame(close_code_for(e.kind()), "subscribe failed");
            let _ = sink.lock().await.send(WsMessage::Close(Some(frame))).await;
            return;
        }
        self.sessions.insert(
            self.client.id.clone(),
            SessionInfo {
                channel: self.client.channel.clone(),
                subtopic: self.client.subtopic.clone(),
                publisher: self.client.publisher.clone(),
                connected_at: now_nanos(),
            },
        );

        let mut writer = tokio::spawn(write_loop(
            sink.clone(),
            self.client.queue.clone(),
            self.client.id.clone(),
        ));

        let mut signal = self.signal.clone();
        let close = tokio::select! {
            close = self.read_loop(&mut stream) => close,
            _ = &mut writer => None,
            _ = signal.cancelled() => Some(close_frame(CLOSE_GOING_AWAY, "shutting down")),
        };

        self.teardown().await;
        writer.abort();
        if let Some(frame) = close {
            let _ = sink.lock().await.send(WsMessage::Close(Some(frame))).await;
        }
        info!(client = %self.client.id, "websocket session closed");
    }

    /// Publish every frame in arrival order. Returns the close frame to send
    /// when the session ends on our side, `None` when the peer went away.
    async fn read_loop(&self, stream: &mut SplitStream<WebSocket>) -> Option<CloseFrame> {
        while let Some(frame) = stream.next().await {
            let payload = match frame {
                Ok(WsMessage::Text(text)) => text.as_str().as_bytes().to_vec(),
                Ok(WsMessage::Binary(bytes)) => bytes.to_vec(),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    debug!(client = %self.client.id, error = %e, "websocket read failed");
                    return None;
                }
            };

            let inbound = Inbound {
                channel: self.client.channel.clone(),
                subtopic: self.raw_subtopic.clone(),
                key: Some(self.key.clone()),
                payload,
                content_type: String::new(),
            };
            if let Err(e) = self.adapter.publish(inbound).await {
                let kind = e.kind();
                if kind == ErrorKind::Unavailable || kind == ErrorKind::Internal {
                    warn!(client = %self.client.id, error = %e, "closing session after publish failure");
                } else {
                    debug!(client = %self.client.id, error = %e, "closing session after rejected publish");
                }
                return Some(close_frame(close_code_for(kind), kind.as_str()));
            }
        }
        None
    }

    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.adapter.unsubscribe(&self.client).await {
            debug!(client = %self.client.id, error = %e, "unsubscribe on teardown");
        }
        self.client.queue.close();
        self.sessions.remove(&self.client.id);
    }
}
