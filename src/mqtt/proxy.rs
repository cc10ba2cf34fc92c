//! Transparent MQTT proxy.
//!
//! Each accepted client gets its own upstream connection to the real MQTT
//! broker. Client-to-broker packets are framed and passed through the hooks;
//! broker-to-client bytes are copied untouched. A refused CONNECT is
//! answered locally and never opens an upstream connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::connack_code_for;
use super::hooks::{Hooks, MqttClient};
use super::packet::{
    CONNECT, DISCONNECT, PUBLISH, PacketError, SUBSCRIBE, encode_connack, parse_connect,
    parse_publish, parse_subscribe, read_packet,
};
use crate::server::{SessionGuard, Shutdown, Signal};
use crate::utils::error::{ErrorKind, Result};

pub struct MqttProxy {
    hooks: Hooks,
    target: String,
    max_packet_bytes: usize,
    shutdown: Arc<Shutdown>,
}

impl MqttProxy {
    pub fn new(
        hooks: Hooks,
        target: impl Into<String>,
        max_packet_bytes: usize,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            hooks,
            target: target.into(),
            max_packet_bytes,
            shutdown,
        }
    }

    /// Accept clients until shutdown is signalled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut signal: Signal) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, upstream = %self.target, "MQTT proxy listening");
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let Some(guard) = self.shutdown.session() else {
                        debug!(%peer, "refusing MQTT client during shutdown");
                        continue;
                    };
                    let proxy = self.clone();
                    tokio::spawn(async move { proxy.handle(stream, peer, guard).await });
                }
            }
        }
        Ok(())
    }

    async fn handle(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr, _guard: SessionGuard) {
        let connect = match read_packet(&mut stream, self.max_packet_bytes).await {
            Ok(Some(raw)) if raw.packet_type == CONNECT => match parse_connect(raw.body()) {
                Ok(connect) => (raw, connect),
                Err(e) => {
                    warn!(%peer, error = %e, "malformed CONNECT");
                    return;
                }
            },
            Ok(Some(raw)) => {
                warn!(%peer, packet_type = raw.packet_type, "first packet is not CONNECT");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                debug!(%peer, error = %e, "failed to read CONNECT");
                return;
            }
        };
        let (raw_connect, connect) = connect;

        let client = match self.hooks.auth_connect(&connect).await {
            Ok(client) => client,
            Err(e) => {
                info!(%peer, client = %connect.client_id, error = %e, "CONNECT refused");
                refuse(&mut stream, connect.level, e.kind()).await;
                return;
            }
        };

        let mut upstream = match TcpStream::connect(&self.target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(upstream = %self.target, error = %e, "upstream broker unreachable");
                refuse(&mut stream, connect.level, ErrorKind::Unavailable).await;
                self.hooks.disconnect(&client);
                return;
            }
        };
        if let Err(e) = upstream.write_all(&raw_connect.bytes).await {
            warn!(upstream = %self.target, error = %e, "failed to forward CONNECT");
            self.hooks.disconnect(&client);
            return;
        }

        let (mut client_read, mut client_write) = stream.into_split();
        let (mut upstream_read, upstream_write) = upstream.into_split();
        let mut signal = self.shutdown.signal();

        tokio::select! {
            result = self.inbound(&client, &mut client_read, upstream_write) => {
                if let Err(e) = result {
                    debug!(client = %client.client_id, error = %e, "client stream ended");
                }
            }
            result = tokio::io::copy(&mut upstream_read, &mut client_write) => {
                if let Err(e) = result {
                    debug!(client = %client.client_id, error = %e, "upstream stream ended");
                }
            }
            _ = signal.cancelled() => {
                debug!(client = %client.client_id, "closing MQTT session for shutdown");
            }
        }
        let _ = client_write.shutdown().await;
        self.hooks.disconnect(&client);
    }

    /// Client-to-broker direction. Returns when the client disconnects or a
    /// hook refuses a packet.
    async fn inbound<R, W>(&self, client: &MqttClient, reader: &mut R, mut upstream: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let raw = match read_packet(reader, self.max_packet_bytes).await {
                Ok(Some(raw)) => raw,
                Ok(None) => return Ok(()),
                Err(PacketError::Io(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(client = %client.client_id, error = %e, "dropping client after bad packet");
                    return Ok(());
                }
            };

            match raw.packet_type {
                PUBLISH => {
                    let publish = match parse_publish(raw.flags, raw.body(), client.level) {
                        Ok(publish) => publish,
                        Err(e) => {
                            warn!(client = %client.client_id, error = %e, "malformed PUBLISH");
                            return Ok(());
                        }
                    };
                    let msg = match self.hooks.auth_publish(client, &publish).await {
                        Ok(msg) => msg,
                        Err(e) => {
                            info!(client = %client.client_id, topic = %publish.topic, error = %e, "PUBLISH refused");
                            return Ok(());
                        }
                    };
                    upstream.write_all(&raw.bytes).await?;
                    self.hooks.publish(client, &msg).await;
                }
                SUBSCRIBE => {
                    let subscribe = match parse_subscribe(raw.body(), client.level) {
                        Ok(subscribe) => subscribe,
                        Err(e) => {
                            warn!(client = %client.client_id, error = %e, "malformed SUBSCRIBE");
                            return Ok(());
                        }
                    };
                    if let Err(e) = self.hooks.auth_subscribe(client, &subscribe.filters).await {
                        info!(client = %client.client_id, filters = ?subscribe.filters, error = %e, "SUBSCRIBE refused");
                        return Ok(());
                    }
                    upstream.write_all(&raw.bytes).await?;
                    debug!(client = %client.client_id, filters = ?subscribe.filters, "subscribed");
                }
                DISCONNECT => {
                    upstream.write_all(&raw.bytes).await?;
                    return Ok(());
                }
                _ => upstream.write_all(&raw.bytes).await?,
            }
        }
    }
}

/// Answer a refused CONNECT and close the socket.
async fn refuse(stream: &mut TcpStream, level: u8, kind: ErrorKind) {
    let connack = encode_connack(level, connack_code_for(kind, level));
    if let Err(e) = stream.write_all(&connack).await {
        debug!(error = %e, "failed to write CONNACK");
    }
    let _ = stream.shutdown().await;
}
