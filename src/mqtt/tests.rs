use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::packet::{
    self, Connect, PacketError, encode_connack, encode_packet, parse_connect, parse_publish,
    parse_subscribe, read_packet, read_variable_length, write_string, write_variable_length,
};
use super::{Hooks, MqttProxy, connack_code_for};
use crate::adapter::{Adapter, QueueHandler};
use crate::auth::MemoryAuth;
use crate::client::EgressQueue;
use crate::events::{EventStore, PresenceKind};
use crate::messaging::{MemoryBroker, Message, Protocol, PubSub, Subscriber, SubscriberConfig};
use crate::server::Shutdown;
use crate::utils::error::ErrorKind;

const MAX_PACKET: usize = 64 * 1024;

fn connect_packet(level: u8, client_id: &str, username: Option<&str>, password: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    write_string(if level == packet::LEVEL_3_1 { "MQIsdp" } else { "MQTT" }, &mut body);
    body.push(level);
    let mut flags = 0x02;
    if username.is_some() {
        flags |= 0x80;
    }
    if password.is_some() {
        flags |= 0x40;
    }
    body.push(flags);
    body.extend_from_slice(&60u16.to_be_bytes());
    if level == packet::LEVEL_5 {
        // session expiry interval property
        body.extend_from_slice(&[0x05, 0x11, 0x00, 0x00, 0x00, 0x0A]);
    }
    write_string(client_id, &mut body);
    if let Some(username) = username {
        write_string(username, &mut body);
    }
    if let Some(password) = password {
        write_string(password, &mut body);
    }
    encode_packet(0x10, &body).unwrap()
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    write_string(topic, &mut body);
    body.extend_from_slice(payload);
    encode_packet(0x30, &body).unwrap()
}

fn subscribe_packet(packet_id: u16, filters: &[&str]) -> Vec<u8> {
    let mut body = packet_id.to_be_bytes().to_vec();
    for filter in filters {
        write_string(filter, &mut body);
        body.push(0x00);
    }
    encode_packet(0x82, &body).unwrap()
}

fn body_of(packet: &[u8]) -> Vec<u8> {
    let (_, used) = read_variable_length(&packet[1..]).unwrap();
    packet[1 + used..].to_vec()
}

#[test]
fn test_variable_length() {
    assert_eq!(read_variable_length(&[0x7F]).unwrap(), (127, 1));
    assert_eq!(read_variable_length(&[0x80, 0x01]).unwrap(), (128, 2));
    assert_eq!(
        read_variable_length(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
        (packet::MAX_REMAINING_LENGTH, 4)
    );
    assert!(matches!(read_variable_length(&[0x80]), Err(PacketError::Incomplete)));
    assert!(matches!(
        read_variable_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(PacketError::InvalidLength)
    ));

    let mut out = Vec::new();
    assert_eq!(write_variable_length(321, &mut out).unwrap(), 2);
    assert_eq!(out, vec![0xC1, 0x02]);
    assert!(write_variable_length(packet::MAX_REMAINING_LENGTH + 1, &mut Vec::new()).is_err());
}

#[test]
fn test_parse_connect_levels() {
    for level in [packet::LEVEL_3_1, packet::LEVEL_3_1_1, packet::LEVEL_5] {
        let raw = connect_packet(level, "dev-1", Some("thing-1"), Some("k1"));
        let connect = parse_connect(&body_of(&raw)).unwrap();
        assert_eq!(
            connect,
            Connect {
                level,
                client_id: "dev-1".to_string(),
                username: Some("thing-1".to_string()),
                password: Some(b"k1".to_vec()),
            }
        );
    }

    let anonymous = parse_connect(&body_of(&connect_packet(4, "dev-2", None, None))).unwrap();
    assert_eq!(anonymous.username, None);
    assert_eq!(anonymous.password, None);
}

#[test]
fn test_parse_connect_rejects_unknown_protocol() {
    let mut body = Vec::new();
    write_string("MQTT", &mut body);
    body.extend_from_slice(&[6, 0x02, 0, 60]);
    write_string("dev", &mut body);
    assert!(matches!(
        parse_connect(&body),
        Err(PacketError::UnsupportedProtocolLevel(6))
    ));

    let mut body = Vec::new();
    write_string("HTTP", &mut body);
    body.extend_from_slice(&[4, 0x02, 0, 60]);
    assert!(matches!(
        parse_connect(&body),
        Err(PacketError::InvalidProtocolName(_))
    ));

    assert!(matches!(parse_connect(&[0x00]), Err(PacketError::Incomplete)));
}

#[test]
fn test_parse_publish() {
    let raw = publish_packet("channels/ch-1/messages/temp", b"22.5");
    let publish = parse_publish(0, &body_of(&raw), packet::LEVEL_3_1_1).unwrap();
    assert_eq!(publish.topic, "channels/ch-1/messages/temp");
    assert_eq!(publish.qos, 0);
    assert_eq!(publish.packet_id, None);
    assert_eq!(publish.payload, b"22.5");

    let mut body = Vec::new();
    write_string("channels/ch-1/messages", &mut body);
    body.extend_from_slice(&7u16.to_be_bytes());
    // content type property
    body.extend_from_slice(&[0x05, 0x03, 0x00, 0x02, b'j', b's']);
    body.extend_from_slice(b"{}");
    let publish = parse_publish(0x02, &body, packet::LEVEL_5).unwrap();
    assert_eq!(publish.qos, 1);
    assert_eq!(publish.packet_id, Some(7));
    assert_eq!(publish.payload, b"{}");

    assert!(parse_publish(0x06, &body, packet::LEVEL_5).is_err());
}

#[test]
fn test_parse_subscribe() {
    let raw = subscribe_packet(3, &["channels/ch-1/messages/#", "channels/ch-2/messages"]);
    let subscribe = parse_subscribe(&body_of(&raw), packet::LEVEL_3_1_1).unwrap();
    assert_eq!(subscribe.packet_id, 3);
    assert_eq!(
        subscribe.filters,
        vec!["channels/ch-1/messages/#", "channels/ch-2/messages"]
    );

    assert!(parse_subscribe(&3u16.to_be_bytes(), packet::LEVEL_3_1_1).is_err());
}

#[tokio::test]
async fn test_read_packet_frames_stream() {
    let first = publish_packet("channels/ch-1/messages", b"a");
    let second = vec![0xE0, 0x00];
    let mut wire: Vec<u8> = first.clone();
    wire.extend_from_slice(&second);
    let mut reader = wire.as_slice();

    let raw = read_packet(&mut reader, MAX_PACKET).await.unwrap().unwrap();
    assert_eq!(raw.packet_type, packet::PUBLISH);
    assert_eq!(raw.bytes, first);
    let raw = read_packet(&mut reader, MAX_PACKET).await.unwrap().unwrap();
    assert_eq!(raw.packet_type, packet::DISCONNECT);
    assert!(raw.body().is_empty());
    assert!(read_packet(&mut reader, MAX_PACKET).await.unwrap().is_none());

    let big = publish_packet("channels/ch-1/messages", &[0u8; 200]);
    let mut reader = big.as_slice();
    assert!(matches!(
        read_packet(&mut reader, 100).await,
        Err(PacketError::TooLarge { max: 100, .. })
    ));
}

#[test]
fn test_connack_codes() {
    assert_eq!(encode_connack(4, 0x05), vec![0x20, 0x02, 0x00, 0x05]);
    assert_eq!(encode_connack(5, 0x87), vec![0x20, 0x03, 0x00, 0x87, 0x00]);

    assert_eq!(connack_code_for(ErrorKind::Unauthorized, 4), 0x05);
    assert_eq!(connack_code_for(ErrorKind::Unauthorized, 3), 0x05);
    assert_eq!(connack_code_for(ErrorKind::Unauthorized, 5), 0x87);
    assert_eq!(connack_code_for(ErrorKind::Unavailable, 4), 0x03);
    assert_eq!(connack_code_for(ErrorKind::Unavailable, 5), 0x88);
}

struct Fixture {
    hooks: Hooks,
    broker: Arc<MemoryBroker>,
    auth: Arc<MemoryAuth>,
}

fn fixture(events: Option<Arc<EventStore>>) -> Fixture {
    let auth = Arc::new(
        MemoryAuth::new()
            .with_thing("k1", "thing-1")
            .with_grant("ch-1", "thing-1"),
    );
    let broker = Arc::new(MemoryBroker::new());
    let pubsub: Arc<dyn PubSub> = broker.clone();
    let adapter = Adapter::new(Protocol::Mqtt, auth.clone(), pubsub);
    Fixture {
        hooks: Hooks::new(adapter, events, "mqtt-test"),
        broker,
        auth,
    }
}

fn event_store() -> (Arc<EventStore>, TempDir) {
    let dir = tempdir().unwrap();
    let store = EventStore::open(dir.path().to_str().unwrap(), 10).unwrap();
    (Arc::new(store), dir)
}

async fn tap(broker: &MemoryBroker) -> Arc<EgressQueue<Message>> {
    let queue = Arc::new(EgressQueue::new(16, "test"));
    broker
        .subscribe(SubscriberConfig::new(
            "tap",
            "channels.>",
            Arc::new(QueueHandler::new(queue.clone())),
        ))
        .await
        .unwrap();
    queue
}

async fn next(queue: &EgressQueue<Message>) -> Option<Message> {
    tokio::time::timeout(Duration::from_millis(200), queue.pop())
        .await
        .ok()
        .flatten()
}

fn connect_of(username: Option<&str>, password: Option<&str>) -> Connect {
    Connect {
        level: packet::LEVEL_3_1_1,
        client_id: "dev-1".to_string(),
        username: username.map(str::to_string),
        password: password.map(|p| p.as_bytes().to_vec()),
    }
}

#[tokio::test]
async fn test_auth_connect() {
    let (events, _dir) = event_store();
    let f = fixture(Some(events.clone()));

    let client = f.hooks.auth_connect(&connect_of(Some("thing-1"), Some("k1"))).await.unwrap();
    assert_eq!(client.thing_id, "thing-1");
    assert_eq!(client.key, "k1");
    let recorded = events.read_group("presence", 10).unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].1.kind, PresenceKind::Connected);
    assert_eq!(recorded[0].1.instance_id, "mqtt-test");

    f.hooks.disconnect(&client);
    let recorded = events.read_group("presence", 10).unwrap();
    assert_eq!(recorded[1].1.kind, PresenceKind::Disconnected);

    let no_password = f.hooks.auth_connect(&connect_of(None, None)).await.unwrap_err();
    assert_eq!(no_password.kind(), ErrorKind::Unauthorized);
    let bad_key = f.hooks.auth_connect(&connect_of(None, Some("bad-key"))).await.unwrap_err();
    assert_eq!(bad_key.kind(), ErrorKind::Unauthorized);
    let wrong_user = f.hooks.auth_connect(&connect_of(Some("thing-9"), Some("k1"))).await.unwrap_err();
    assert_eq!(wrong_user.kind(), ErrorKind::Unauthorized);

    f.auth.set_available(false);
    let outage = f.hooks.auth_connect(&connect_of(None, Some("k1"))).await.unwrap_err();
    assert_eq!(outage.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn test_auth_publish_and_subscribe() {
    let f = fixture(None);
    let client = f.hooks.auth_connect(&connect_of(None, Some("k1"))).await.unwrap();

    let publish = parse_publish(
        0,
        &body_of(&publish_packet("channels/ch-1/messages/temp/room", b"1")),
        packet::LEVEL_3_1_1,
    )
    .unwrap();
    let msg = f.hooks.auth_publish(&client, &publish).await.unwrap();
    assert_eq!(msg.channel, "ch-1");
    assert_eq!(msg.subtopic, "temp.room");
    assert_eq!(msg.publisher, "thing-1");
    assert_eq!(msg.protocol, Protocol::Mqtt);

    let other = parse_publish(0, &body_of(&publish_packet("channels/ch-2/messages", b"1")), 4).unwrap();
    let err = f.hooks.auth_publish(&client, &other).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let malformed = parse_publish(0, &body_of(&publish_packet("devices/ch-1", b"1")), 4).unwrap();
    let err = f.hooks.auth_publish(&client, &malformed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    let filters = vec!["channels/ch-1/messages/+/room".to_string(), "/channels/ch-1/messages/#".to_string()];
    f.hooks.auth_subscribe(&client, &filters).await.unwrap();
    let filters = vec!["channels/ch-1/messages".to_string(), "channels/ch-2/messages".to_string()];
    let err = f.hooks.auth_subscribe(&client, &filters).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

struct ProxyHarness {
    addr: SocketAddr,
    upstream: TcpListener,
    broker: Arc<MemoryBroker>,
}

async fn start_proxy() -> ProxyHarness {
    let f = fixture(None);
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = upstream.local_addr().unwrap().to_string();
    let shutdown = Arc::new(Shutdown::new(Duration::from_secs(2)));
    let proxy = Arc::new(MqttProxy::new(f.hooks, target, MAX_PACKET, shutdown.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(proxy.serve(listener, shutdown.signal()));
    ProxyHarness {
        addr,
        upstream,
        broker: f.broker,
    }
}

async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

#[tokio::test]
async fn test_bad_password_is_refused_without_upstream() {
    let h = start_proxy().await;
    let observed = tap(&h.broker).await;

    let mut device = TcpStream::connect(h.addr).await.unwrap();
    device
        .write_all(&connect_packet(4, "dev-1", None, Some("bad-key")))
        .await
        .unwrap();
    let mut connack = [0u8; 4];
    device.read_exact(&mut connack).await.unwrap();
    assert_eq!(connack, [0x20, 0x02, 0x00, 0x05]);

    let _ = device
        .write_all(&publish_packet("channels/ch-1/messages", b"x"))
        .await;
    let mut rest = Vec::new();
    let tail = tokio::time::timeout(Duration::from_secs(1), device.read_to_end(&mut rest))
        .await
        .unwrap();
    assert!(tail.is_err() || rest.is_empty());

    let accepted = tokio::time::timeout(Duration::from_millis(200), h.upstream.accept()).await;
    assert!(accepted.is_err(), "proxy must not dial upstream for a refused client");
    assert!(next(&observed).await.is_none());
}

#[tokio::test]
async fn test_v5_refusal_uses_reason_code() {
    let h = start_proxy().await;
    let mut device = TcpStream::connect(h.addr).await.unwrap();
    device
        .write_all(&connect_packet(5, "dev-1", None, Some("bad-key")))
        .await
        .unwrap();
    assert_eq!(read_to_end(&mut device).await, vec![0x20, 0x03, 0x00, 0x87, 0x00]);
}

#[tokio::test]
async fn test_publish_is_forwarded_and_mirrored() {
    let h = start_proxy().await;
    let observed = tap(&h.broker).await;

    let connect = connect_packet(4, "dev-1", Some("thing-1"), Some("k1"));
    let publish = publish_packet("channels/ch-1/messages/temp", b"22.5");

    let mut device = TcpStream::connect(h.addr).await.unwrap();
    device.write_all(&connect).await.unwrap();

    let (mut broker_side, _) = h.upstream.accept().await.unwrap();
    let mut received = vec![0u8; connect.len()];
    broker_side.read_exact(&mut received).await.unwrap();
    assert_eq!(received, connect);
    broker_side.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

    let mut connack = [0u8; 4];
    device.read_exact(&mut connack).await.unwrap();
    assert_eq!(connack, [0x20, 0x02, 0x00, 0x00]);

    device.write_all(&publish).await.unwrap();
    let mut received = vec![0u8; publish.len()];
    broker_side.read_exact(&mut received).await.unwrap();
    assert_eq!(received, publish);

    let msg = next(&observed).await.unwrap();
    assert_eq!(msg.channel, "ch-1");
    assert_eq!(msg.subtopic, "temp");
    assert_eq!(msg.publisher, "thing-1");
    assert_eq!(msg.protocol, Protocol::Mqtt);
    assert_eq!(msg.payload, b"22.5");
}

#[tokio::test]
async fn test_unauthorized_publish_closes_session() {
    let h = start_proxy().await;
    let observed = tap(&h.broker).await;

    let connect = connect_packet(4, "dev-1", None, Some("k1"));
    let mut device = TcpStream::connect(h.addr).await.unwrap();
    device.write_all(&connect).await.unwrap();

    let (mut broker_side, _) = h.upstream.accept().await.unwrap();
    let mut received = vec![0u8; connect.len()];
    broker_side.read_exact(&mut received).await.unwrap();

    device
        .write_all(&publish_packet("channels/ch-2/messages", b"x"))
        .await
        .unwrap();

    // Nothing past the CONNECT reaches the broker before the proxy hangs up.
    assert!(read_to_end(&mut broker_side).await.is_empty());
    assert!(next(&observed).await.is_none());
}
