use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use super::message::{CONTENT_FORMAT, OBSERVE, URI_PATH, URI_QUERY, decode_uint, encode_uint};
use super::server::next_observe;
use super::{
    CoapError, CoapMessage, CoapServer, Code, MessageType, code_for, content_format_for,
    content_type_for,
};
use crate::adapter::{Adapter, Inbound, QueueHandler};
use crate::auth::MemoryAuth;
use crate::client::EgressQueue;
use crate::messaging::{MemoryBroker, Message, Protocol, PubSub, Subscriber, SubscriberConfig};
use crate::server::Shutdown;
use crate::utils::error::ErrorKind;

fn request(mtype: MessageType, code: Code, mid: u16, path: &str, query: Option<&str>) -> CoapMessage {
    let mut msg = CoapMessage::new(mtype, code, mid).with_token(&[0xCA, 0xFE]);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        msg.add_option(URI_PATH, segment.as_bytes().to_vec());
    }
    if let Some(query) = query {
        msg.add_option(URI_QUERY, query.as_bytes().to_vec());
    }
    msg
}

#[test]
fn test_codec_header_and_payload() {
    let msg = request(MessageType::Confirmable, Code::POST, 0x1234, "/channels/ch-1/messages", Some("auth=k1"))
        .with_option(CONTENT_FORMAT, encode_uint(110))
        .with_payload(b"[]".to_vec());
    let bytes = msg.encode().unwrap();

    assert_eq!(bytes[0], 0x42);
    assert_eq!(bytes[1], 0x02);
    assert_eq!(&bytes[2..4], &[0x12, 0x34]);
    assert_eq!(&bytes[4..6], &[0xCA, 0xFE]);
    assert_eq!(&bytes[bytes.len() - 3..], &[0xFF, b'[', b']']);

    let decoded = CoapMessage::decode(&bytes).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.path(), "/channels/ch-1/messages");
    assert_eq!(decoded.query("auth").as_deref(), Some("k1"));
    assert_eq!(decoded.query("other"), None);
    assert_eq!(decoded.content_format().unwrap().unwrap(), 110);
}

#[test]
fn test_codec_extended_options() {
    let long_segment = "s".repeat(300);
    let msg = CoapMessage::new(MessageType::NonConfirmable, Code::GET, 1)
        .with_option(URI_PATH, long_segment.as_bytes().to_vec())
        .with_option(2048, vec![1, 2, 3])
        .with_option(URI_PATH, b"x".to_vec());
    let decoded = CoapMessage::decode(&msg.encode().unwrap()).unwrap();

    assert_eq!(decoded.path(), format!("/{long_segment}/x"));
    assert_eq!(decoded.option(2048), Some(&[1u8, 2, 3][..]));
}

#[test]
fn test_codec_rejects_bad_frames() {
    assert!(matches!(CoapMessage::decode(&[0x40, 0x01]), Err(CoapError::Truncated)));
    assert!(matches!(
        CoapMessage::decode(&[0x80, 0x01, 0x00, 0x01]),
        Err(CoapError::BadVersion(2))
    ));
    assert!(matches!(
        CoapMessage::decode(&[0x49, 0x01, 0x00, 0x01]),
        Err(CoapError::InvalidTokenLength(9))
    ));
    assert!(matches!(
        CoapMessage::decode(&[0x40, 0x01, 0x00, 0x01, 0xFF]),
        Err(CoapError::EmptyPayload)
    ));
    assert!(matches!(
        CoapMessage::decode(&[0x40, 0x01, 0x00, 0x01, 0xF1, 0x00]),
        Err(CoapError::InvalidOption(_))
    ));
    assert!(matches!(
        CoapMessage::decode(&[0x42, 0x01, 0x00, 0x01, 0xAA]),
        Err(CoapError::Truncated)
    ));
}

#[test]
fn test_uint_options() {
    assert!(encode_uint(0).is_empty());
    assert_eq!(encode_uint(1), vec![1]);
    assert_eq!(encode_uint(0x01_0000), vec![1, 0, 0]);
    assert_eq!(decode_uint(&[]).unwrap(), 0);
    assert_eq!(decode_uint(&[1, 0, 0]).unwrap(), 0x01_0000);
    assert!(decode_uint(&[1, 2, 3, 4, 5]).is_err());
}

#[test]
fn test_code_display_and_mapping() {
    assert_eq!(Code::CONTENT.to_string(), "2.05");
    assert_eq!(Code::BAD_OPTION.to_string(), "4.02");
    assert!(Code::GET.is_request());
    assert!(!Code::EMPTY.is_request());

    assert_eq!(code_for(ErrorKind::Unauthorized), Code::UNAUTHORIZED);
    assert_eq!(code_for(ErrorKind::Malformed), Code::BAD_REQUEST);
    assert_eq!(code_for(ErrorKind::NotFound), Code::NOT_FOUND);
    assert_eq!(code_for(ErrorKind::Unavailable), Code::INTERNAL_SERVER_ERROR);
}

#[test]
fn test_observe_sequence_wraps_at_24_bits() {
    assert_eq!(next_observe(0), 1);
    assert_eq!(next_observe(41), 42);
    assert_eq!(next_observe(0xFF_FFFE), 0xFF_FFFF);
    assert_eq!(next_observe(0xFF_FFFF), 0);
}

#[test]
fn test_content_formats() {
    assert_eq!(content_format_for("application/senml+json"), 110);
    assert_eq!(content_format_for("application/json; charset=utf-8"), 50);
    assert_eq!(content_format_for(""), 0);
    assert_eq!(content_format_for("image/png"), 0);
    assert_eq!(content_type_for(112), "application/senml+cbor");
    assert_eq!(content_type_for(9999), "");
}

struct Harness {
    server: Arc<CoapServer>,
    addr: SocketAddr,
    device: UdpSocket,
    broker: Arc<MemoryBroker>,
    http: Adapter,
}

async fn start() -> Harness {
    start_with(None).await
}

/// `keepalive` overrides the observer liveness timers.
async fn start_with(keepalive: Option<(Duration, Duration)>) -> Harness {
    let auth = Arc::new(
        MemoryAuth::new()
            .with_thing("k1", "thing-1")
            .with_thing("k2", "thing-2")
            .with_grant("ch-1", "thing-1")
            .with_grant("ch-1", "thing-2"),
    );
    let broker = Arc::new(MemoryBroker::new());
    let pubsub: Arc<dyn PubSub> = broker.clone();
    let shutdown = Arc::new(Shutdown::new(Duration::from_secs(2)));

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut server = CoapServer::new(
        Adapter::new(Protocol::Coap, auth.clone(), pubsub.clone()),
        socket,
        8,
        shutdown.clone(),
    );
    if let Some((interval, ack_timeout)) = keepalive {
        server = server.with_keepalive(interval, ack_timeout);
    }
    let server = Arc::new(server);
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.clone().serve(shutdown.signal()));

    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    Harness {
        server,
        addr,
        device,
        broker,
        http: Adapter::new(Protocol::Http, auth, pubsub),
    }
}

impl Harness {
    async fn send(&self, msg: &CoapMessage) {
        self.device.send_to(&msg.encode().unwrap(), self.addr).await.unwrap();
    }

    async fn recv(&self) -> Option<CoapMessage> {
        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_millis(300), self.device.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some(CoapMessage::decode(&buf[..len]).unwrap())
    }

    async fn call(&self, msg: &CoapMessage) -> CoapMessage {
        self.send(msg).await;
        self.recv().await.unwrap()
    }

    async fn publish_http(&self, payload: &str) {
        let inbound = Inbound {
            channel: "ch-1".to_string(),
            key: Some("k2".to_string()),
            payload: payload.as_bytes().to_vec(),
            content_type: "application/json".to_string(),
            ..Default::default()
        };
        self.http.publish(inbound).await.unwrap();
    }
}

fn observe_request(mid: u16, observe: u32) -> CoapMessage {
    request(MessageType::Confirmable, Code::GET, mid, "/channels/ch-1/messages", Some("auth=k1"))
        .with_option(OBSERVE, encode_uint(observe))
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

#[tokio::test]
async fn test_observe_lifecycle() {
    let h = start().await;

    let ack = h.call(&observe_request(10, 0)).await;
    assert_eq!(ack.mtype, MessageType::Acknowledgement);
    assert_eq!(ack.message_id, 10);
    assert_eq!(ack.code, Code::CONTENT);
    assert_eq!(ack.token, vec![0xCA, 0xFE]);
    assert_eq!(ack.observe().unwrap().unwrap(), 0);
    assert_eq!(h.server.observer_count(), 1);

    let mut sequence = Vec::new();
    for payload in ["one", "two", "three"] {
        h.publish_http(payload).await;
        let notification = h.recv().await.unwrap();
        assert_eq!(notification.mtype, MessageType::NonConfirmable);
        assert_eq!(notification.token, vec![0xCA, 0xFE]);
        assert_eq!(notification.payload, payload.as_bytes());
        assert_eq!(notification.content_format().unwrap().unwrap(), 50);
        sequence.push(notification.observe().unwrap().unwrap());
    }
    assert!(sequence.windows(2).all(|w| w[0] < w[1]), "observe values {sequence:?}");

    let ack = h.call(&observe_request(11, 1)).await;
    assert_eq!(ack.code, Code::CONTENT);
    assert_eq!(ack.message_id, 11);
    assert_eq!(h.server.observer_count(), 0);

    h.publish_http("four").await;
    assert!(h.recv().await.is_none());
}

#[tokio::test]
async fn test_reset_cancels_observer() {
    let h = start().await;
    h.call(&observe_request(20, 0)).await;

    h.publish_http("one").await;
    let notification = h.recv().await.unwrap();

    h.send(&CoapMessage::new(MessageType::Reset, Code::EMPTY, notification.message_id))
        .await;
    for _ in 0..50 {
        if h.server.observer_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.server.observer_count(), 0);

    h.publish_http("two").await;
    assert!(h.recv().await.is_none());
}

#[tokio::test]
async fn test_post_publishes() {
    let h = start().await;
    let observed = tap(&h.broker).await;

    let req = request(MessageType::Confirmable, Code::POST, 30, "/channels/ch-1/messages/temp", Some("auth=k1"))
        .with_option(CONTENT_FORMAT, encode_uint(110))
        .with_payload(b"[{\"n\":\"t\",\"v\":1}]".to_vec());
    let ack = h.call(&req).await;
    assert_eq!(ack.code, Code::CREATED);
    assert_eq!(ack.message_id, 30);

    let msg = tokio::time::timeout(Duration::from_millis(200), observed.pop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.protocol, Protocol::Coap);
    assert_eq!(msg.subtopic, "temp");
    assert_eq!(msg.publisher, "thing-1");
    assert_eq!(msg.content_type, "application/senml+json");

    let non = request(MessageType::NonConfirmable, Code::POST, 31, "/channels/ch-1/messages", Some("auth=k1"))
        .with_payload(b"x".to_vec());
    let reply = h.call(&non).await;
    assert_eq!(reply.mtype, MessageType::NonConfirmable);
    assert_eq!(reply.code, Code::CREATED);
}

#[tokio::test]
async fn test_request_errors() {
    let h = start().await;
    let observed = tap(&h.broker).await;

    let cases = [
        (request(MessageType::Confirmable, Code::POST, 40, "/channels/ch-1/messages", None), Code::UNAUTHORIZED),
        (request(MessageType::Confirmable, Code::POST, 41, "/channels/ch-1/messages", Some("auth=bad")), Code::UNAUTHORIZED),
        (request(MessageType::Confirmable, Code::POST, 42, "/devices/ch-1", Some("auth=k1")), Code::NOT_FOUND),
        (request(MessageType::Confirmable, Code::POST, 43, "/channels/ch-1/messages/a*b", Some("auth=k1")), Code::BAD_REQUEST),
        (request(MessageType::Confirmable, Code::PUT, 44, "/channels/ch-1/messages", Some("auth=k1")), Code::NOT_FOUND),
        (request(MessageType::Confirmable, Code::GET, 45, "/channels/ch-1/messages", Some("auth=k1")), Code::BAD_OPTION),
        (observe_request(46, 0).with_option(URI_QUERY, Vec::new()), Code::CONTENT),
    ];
    for (req, expected) in cases {
        let reply = h.call(&req).await;
        assert_eq!(reply.code, expected, "request {}", req.message_id);
        assert_eq!(reply.message_id, req.message_id);
    }

    let unauthorized_observe = request(MessageType::Confirmable, Code::GET, 47, "/channels/ch-1/messages", Some("auth=bad"))
        .with_option(OBSERVE, encode_uint(0));
    assert_eq!(h.call(&unauthorized_observe).await.code, Code::UNAUTHORIZED);

    assert!(
        tokio::time::timeout(Duration::from_millis(100), observed.pop())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_ping_gets_reset() {
    let h = start().await;
    let pong = h
        .call(&CoapMessage::new(MessageType::Confirmable, Code::EMPTY, 77))
        .await;
    assert_eq!(pong.mtype, MessageType::Reset);
    assert_eq!(pong.message_id, 77);
}

async fn wait_for_observers(h: &Harness, n: usize, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    while h.server.observer_count() != n {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {n} observers, have {}",
            h.server.observer_count()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_reset_of_earlier_notification_cancels_observer() {
    let h = start().await;
    h.call(&observe_request(21, 0)).await;

    h.publish_http("one").await;
    let first = h.recv().await.unwrap();
    h.publish_http("two").await;
    let second = h.recv().await.unwrap();
    assert_ne!(first.message_id, second.message_id);

    h.send(&CoapMessage::new(MessageType::Reset, Code::EMPTY, first.message_id))
        .await;
    wait_for_observers(&h, 0, Duration::from_secs(1)).await;
    assert_eq!(h.broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_silent_observer_expires() {
    let h = start_with(Some((Duration::from_millis(100), Duration::from_millis(20)))).await;
    h.call(&observe_request(50, 0)).await;
    assert_eq!(h.broker.subscription_count(), 1);

    // the device never answers the pings it receives
    wait_for_observers(&h, 0, Duration::from_secs(3)).await;
    assert_eq!(h.broker.subscription_count(), 0);

    let ping = h.recv().await;
    assert!(ping.is_none() || ping.unwrap().code == Code::EMPTY);
}

#[tokio::test]
async fn test_answering_observer_stays_registered() {
    let h = start_with(Some((Duration::from_millis(100), Duration::from_millis(50)))).await;
    h.call(&observe_request(60, 0)).await;

    let mut pings = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(700);
    while tokio::time::Instant::now() < deadline {
        let Some(msg) = h.recv().await else {
            continue;
        };
        assert_eq!(msg.mtype, MessageType::Confirmable);
        assert_eq!(msg.code, Code::EMPTY);
        pings += 1;
        h.send(&CoapMessage::new(MessageType::Reset, Code::EMPTY, msg.message_id))
            .await;
    }
    assert!(pings >= 2, "pings answered: {pings}");
    assert_eq!(h.server.observer_count(), 1);

    h.publish_http("still here").await;
    let notification = loop {
        let msg = h.recv().await.unwrap();
        if msg.code == Code::EMPTY {
            h.send(&CoapMessage::new(MessageType::Reset, Code::EMPTY, msg.message_id))
                .await;
            continue;
        }
        break msg;
    };
    assert_eq!(notification.payload, b"still here");
    if notification.mtype == MessageType::Confirmable {
        h.send(&CoapMessage::new(MessageType::Acknowledgement, Code::EMPTY, notification.message_id))
            .await;
    }
    assert_eq!(h.server.observer_count(), 1);
}
