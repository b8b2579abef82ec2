//! Engine behavior tests over an in-memory transport.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use wrenmq_client::transport::ReceiveCallback;
use wrenmq_client::{
    ClientError, ConnectOptions, Encryption, EngineEvents, ProtocolConfig, ProtocolEngine, QoS,
    SessionState, Token, Transport,
};
use wrenmq_core::packet::{
    decode_packet, Connack, ConnectReturnCode, Packet, PacketType, Publish, Suback,
};
use wrenmq_core::ProtocolError;

/// In-memory transport: records written packets, lets tests inject inbound
/// traffic through the receive callback.
struct MockTransport {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    written: Mutex<Vec<u8>>,
    callback: RwLock<Option<ReceiveCallback>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            refuse_connect: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            callback: RwLock::new(None),
        })
    }

    fn inject(&self, packet: Packet) {
        if let Some(callback) = self.callback.read().as_ref() {
            callback(Ok(packet));
        }
    }

    fn inject_error(&self, error: ProtocolError) {
        if let Some(callback) = self.callback.read().as_ref() {
            callback(Err(error));
        }
    }

    fn written_packets(&self) -> Vec<Packet> {
        let buf = self.written.lock().clone();
        let mut packets = Vec::new();
        let mut pos = 0;
        while let Some((packet, consumed)) = decode_packet(&buf[pos..], 0).unwrap() {
            packets.push(packet);
            pos += consumed;
        }
        packets
    }

    fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn connect(&self, _host: &str, _port: u16, _encryption: Encryption) -> io::Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock refused",
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        self.written.lock().extend_from_slice(bytes);
        Ok(())
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self.callback.write() = Some(callback);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn setup(config: ProtocolConfig) -> (ProtocolEngine, EngineEvents, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let (engine, events) =
        ProtocolEngine::new(config, Arc::clone(&transport) as Arc<dyn Transport>);
    (engine, events, transport)
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Drive the engine through a successful connect handshake.
fn connect(engine: &ProtocolEngine, events: &EngineEvents, transport: &MockTransport) {
    engine
        .connect(
            ConnectOptions::new("test-client"),
            "broker.test",
            1883,
            Encryption::None,
            Token(1),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        !transport.written_packets().is_empty()
    }));
    transport.inject(Packet::Connack(Connack {
        return_code: ConnectReturnCode::Accepted,
    }));
    let event = events
        .connect_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert!(event.result.is_ok());
}

fn qos0_publish(topic: &str) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: topic.into(),
        message_id: None,
        payload: Bytes::from_static(b"data"),
    })
}

#[test]
fn connect_success() {
    let (engine, events, transport) = setup(ProtocolConfig::default());

    engine
        .connect(
            ConnectOptions::new("test-client").credentials("alice", "secret"),
            "broker.test",
            1883,
            Encryption::None,
            Token(7),
        )
        .unwrap();
    assert_eq!(engine.session_state(), SessionState::Connecting);

    assert!(wait_until(Duration::from_secs(5), || {
        !transport.written_packets().is_empty()
    }));
    let written = transport.written_packets();
    let Packet::Connect(c) = &written[0] else {
        panic!("expected CONNECT first, got {:?}", written[0]);
    };
    assert_eq!(c.client_id, "test-client");
    assert_eq!(c.username.as_deref(), Some("alice"));
    assert_eq!(c.keep_alive, 60);
    assert!(c.clean_session);

    transport.inject(Packet::Connack(Connack {
        return_code: ConnectReturnCode::Accepted,
    }));
    let event = events
        .connect_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.token, Some(Token(7)));
    assert_eq!(event.session.as_ref(), "test-client-alice");
    assert!(event.result.is_ok());
    assert!(engine.is_connected());
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn connect_rejection_closes_transport() {
    let (engine, events, transport) = setup(ProtocolConfig::default());

    engine
        .connect(
            ConnectOptions::new("test-client"),
            "broker.test",
            1883,
            Encryption::None,
            Token(1),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        !transport.written_packets().is_empty()
    }));

    transport.inject(Packet::Connack(Connack {
        return_code: ConnectReturnCode::BadUserNameOrPassword,
    }));

    let event = events
        .connect_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert!(matches!(
        event.result,
        Err(ClientError::ConnectionRefused(
            ConnectReturnCode::BadUserNameOrPassword
        ))
    ));
    assert_eq!(engine.session_state(), SessionState::Idle);
    assert!(transport.disconnect_calls() >= 1);
    assert!(!transport.is_connected());
}

#[test]
fn connect_validation_precedes_transport() {
    let (engine, _events, transport) = setup(ProtocolConfig::default());

    let result = engine.connect(
        ConnectOptions::new("x".repeat(24)),
        "broker.test",
        1883,
        Encryption::None,
        Token(1),
    );
    assert!(matches!(result, Err(ClientError::Validation(_))));
    assert_eq!(engine.session_state(), SessionState::Idle);

    // The transport never saw the attempt.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn connect_socket_failure_reported_on_channel() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    transport.refuse_connect.store(true, Ordering::SeqCst);

    engine
        .connect(
            ConnectOptions::new("test-client"),
            "broker.test",
            1883,
            Encryption::None,
            Token(3),
        )
        .unwrap();

    let event = events
        .connect_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.token, Some(Token(3)));
    assert!(matches!(event.result, Err(ClientError::Transport(_))));
    assert_eq!(engine.session_state(), SessionState::Idle);
}

#[test]
fn connect_timeout_fails_attempt_and_closes() {
    let config = ProtocolConfig::default().network_timeout(Duration::from_millis(100));
    let (engine, events, transport) = setup(config);

    engine
        .connect(
            ConnectOptions::new("test-client"),
            "broker.test",
            1883,
            Encryption::None,
            Token(5),
        )
        .unwrap();
    // No CONNACK ever arrives.
    let event = events
        .connect_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.token, Some(Token(5)));
    assert!(matches!(event.result, Err(ClientError::NotResponding)));

    // The failure is reported on the connect channel alone.
    thread::sleep(Duration::from_millis(50));
    assert!(events.network_error.try_recv().is_err());

    assert_eq!(engine.session_state(), SessionState::Idle);
    assert!(transport.disconnect_calls() >= 1);
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn qos1_publish_completes_on_puback() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);

    let message_id = engine
        .publish("a/b", Bytes::from_static(b"hi"), QoS::AtLeastOnce, false, Token(9))
        .unwrap()
        .expect("QoS 1 allocates an id");
    assert_eq!(engine.pending_count(), 1);

    transport.inject(Packet::Puback { message_id });

    let event = events
        .send_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.message_type, PacketType::Publish);
    assert_eq!(event.message_id, message_id);
    assert_eq!(event.token, Some(Token(9)));
    assert!(event.result.is_ok());
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn qos2_publish_walks_full_handshake() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);

    let message_id = engine
        .publish("a/b", Bytes::from_static(b"hi"), QoS::ExactlyOnce, false, Token(11))
        .unwrap()
        .unwrap();
    assert_eq!(engine.pending_count(), 1);

    transport.inject(Packet::Pubrec { message_id });
    // The PUBREL goes out synchronously and now waits on PUBCOMP.
    assert!(transport
        .written_packets()
        .iter()
        .any(|p| matches!(p, Packet::Pubrel { message_id: id } if *id == message_id)));
    assert_eq!(engine.pending_count(), 1);
    assert!(events.send_complete.try_recv().is_err());

    transport.inject(Packet::Pubcomp { message_id });
    let event = events
        .send_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.message_id, message_id);
    assert_eq!(event.token, Some(Token(11)));
    assert!(event.result.is_ok());
    assert_eq!(engine.pending_count(), 0);
    assert!(events.send_complete.try_recv().is_err());
}

#[test]
fn qos0_publish_completes_on_write() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);

    let message_id = engine
        .publish("a/b", Bytes::from_static(b"hi"), QoS::AtMostOnce, false, Token(2))
        .unwrap();
    assert_eq!(message_id, None);
    assert_eq!(engine.pending_count(), 0);

    let event = events
        .send_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.message_type, PacketType::Publish);
    assert_eq!(event.token, Some(Token(2)));
    assert!(event.result.is_ok());
}

#[test]
fn inbound_qos1_acks_then_delivers() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    engine
        .subscribe(
            "sensors/+/temp",
            QoS::AtLeastOnce,
            Token(1),
            Arc::new(move |publish| sink.lock().push(publish.topic.clone())),
        )
        .unwrap();
    connect(&engine, &events, &transport);

    transport.inject(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "sensors/attic/temp".into(),
        message_id: Some(5),
        payload: Bytes::from_static(b"21.5"),
    }));

    assert!(transport
        .written_packets()
        .iter()
        .any(|p| matches!(p, Packet::Puback { message_id: 5 })));
    assert_eq!(received.lock().as_slice(), ["sensors/attic/temp"]);
    assert!(events.publish_received.try_recv().is_err());
}

#[test]
fn inbound_qos2_holds_delivery_until_pubrel() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    engine
        .subscribe(
            "jobs/#",
            QoS::ExactlyOnce,
            Token(1),
            Arc::new(move |_publish| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    connect(&engine, &events, &transport);

    transport.inject(Packet::Publish(Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "jobs/42".into(),
        message_id: Some(9),
        payload: Bytes::from_static(b"run"),
    }));

    assert!(transport
        .written_packets()
        .iter()
        .any(|p| matches!(p, Packet::Pubrec { message_id: 9 })));
    // Not delivered yet; the publish is parked on the handshake.
    assert_eq!(count.load(Ordering::SeqCst), 0);

    transport.inject(Packet::Pubrel { message_id: 9 });
    assert!(transport
        .written_packets()
        .iter()
        .any(|p| matches!(p, Packet::Pubcomp { message_id: 9 })));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // A second PUBREL finds no parked publish and delivers nothing more.
    transport.inject(Packet::Pubrel { message_id: 9 });
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn unmatched_publish_reaches_fallback_channel() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);

    transport.inject(qos0_publish("nobody/listens"));

    let publish = events
        .publish_received
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(publish.topic, "nobody/listens");
}

#[test]
fn subscribe_before_connect_goes_out_after_connack() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    engine
        .subscribe("a/+", QoS::AtLeastOnce, Token(4), Arc::new(|_publish| {}))
        .unwrap();
    // Nothing written while idle.
    assert!(transport.written_packets().is_empty());

    connect(&engine, &events, &transport);

    assert!(wait_until(Duration::from_secs(5), || {
        transport
            .written_packets()
            .iter()
            .any(|p| matches!(p, Packet::Subscribe(_)))
    }));
    let written = transport.written_packets();
    let subscribe = written
        .iter()
        .find_map(|p| match p {
            Packet::Subscribe(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(subscribe.topics, vec![("a/+".to_string(), QoS::AtLeastOnce)]);

    transport.inject(Packet::Suback(Suback {
        message_id: subscribe.message_id,
        granted: vec![QoS::AtLeastOnce],
    }));
    let event = events
        .subscribe_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    // The deferred SUBSCRIBE still correlates to the registration.
    assert_eq!(event.token, Some(Token(4)));
    let suback = event.result.unwrap();
    assert_eq!(suback.granted, vec![QoS::AtLeastOnce]);
}

#[test]
fn subscribe_while_connected_carries_token() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);

    engine
        .subscribe("b/c", QoS::ExactlyOnce, Token(21), Arc::new(|_publish| {}))
        .unwrap();

    let written = transport.written_packets();
    let subscribe = written
        .iter()
        .find_map(|p| match p {
            Packet::Subscribe(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();

    transport.inject(Packet::Suback(Suback {
        message_id: subscribe.message_id,
        granted: vec![QoS::ExactlyOnce],
    }));
    let event = events
        .subscribe_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.token, Some(Token(21)));
    assert!(event.result.is_ok());
}

#[test]
fn duplicate_subscription_rejected() {
    let (engine, _events, _transport) = setup(ProtocolConfig::default());
    engine
        .subscribe("a/b", QoS::AtMostOnce, Token(1), Arc::new(|_publish| {}))
        .unwrap();
    assert!(matches!(
        engine.subscribe("a/b", QoS::AtLeastOnce, Token(2), Arc::new(|_publish| {})),
        Err(ClientError::DuplicateSubscription(_))
    ));
}

#[test]
fn unsubscribe_sends_packet_and_completes() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);
    engine
        .subscribe("a/b", QoS::AtMostOnce, Token(1), Arc::new(|_publish| {}))
        .unwrap();

    engine.unsubscribe("a/b", Token(30)).unwrap();
    let written = transport.written_packets();
    let unsubscribe = written
        .iter()
        .find_map(|p| match p {
            Packet::Unsubscribe(u) => Some(u.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(unsubscribe.topics, vec!["a/b".to_string()]);

    transport.inject(Packet::Unsuback {
        message_id: unsubscribe.message_id,
    });
    let event = events
        .send_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.message_type, PacketType::Unsubscribe);
    assert_eq!(event.token, Some(Token(30)));
}

#[test]
fn disconnect_closes_and_reconnect_resubscribes() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    engine
        .subscribe("a/b", QoS::AtMostOnce, Token(1), Arc::new(|_publish| {}))
        .unwrap();
    connect(&engine, &events, &transport);

    engine.disconnect(Token(40)).unwrap();
    let event = events
        .send_complete
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(event.message_type, PacketType::Disconnect);
    assert_eq!(event.token, Some(Token(40)));
    assert!(event.result.is_ok());
    assert_eq!(engine.session_state(), SessionState::Idle);
    assert!(!transport.is_connected());
    assert_eq!(engine.pending_count(), 0);

    // Reconnect; the surviving registration goes out again.
    transport.written.lock().clear();
    connect(&engine, &events, &transport);
    assert!(wait_until(Duration::from_secs(5), || {
        transport
            .written_packets()
            .iter()
            .any(|p| matches!(p, Packet::Subscribe(_)))
    }));
}

#[test]
fn operations_require_connected_session() {
    let (engine, _events, _transport) = setup(ProtocolConfig::default());
    assert!(matches!(
        engine.publish("a", Bytes::new(), QoS::AtMostOnce, false, Token(1)),
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(engine.ping(Token(1)), Err(ClientError::NotConnected)));
    assert!(matches!(
        engine.disconnect(Token(1)),
        Err(ClientError::NotConnected)
    ));
}

#[test]
fn publish_validation_fails_synchronously() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);
    let before = transport.written_packets().len();

    let result = engine.publish(
        "caf\u{e9}/temp",
        Bytes::new(),
        QoS::AtMostOnce,
        false,
        Token(1),
    );
    assert!(matches!(result, Err(ClientError::Validation(_))));
    assert_eq!(transport.written_packets().len(), before);
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn unmatched_response_is_counted_not_delivered() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);
    let baseline = engine.unmatched_responses();

    transport.inject(Packet::Puback { message_id: 42 });

    assert_eq!(engine.unmatched_responses(), baseline + 1);
    assert!(events.send_complete.try_recv().is_err());
    assert!(events.network_error.try_recv().is_err());
}

#[test]
fn decode_failures_are_counted() {
    let (engine, events, transport) = setup(ProtocolConfig::default());
    connect(&engine, &events, &transport);

    transport.inject_error(ProtocolError::InvalidRemainingLength);
    transport.inject_error(ProtocolError::InvalidPacketType(0));

    assert_eq!(engine.decode_failures(), 2);
    assert!(events.network_error.try_recv().is_err());
}

#[test]
fn ping_timeout_closes_connection() {
    let config = ProtocolConfig::default().network_timeout(Duration::from_millis(500));
    let (engine, events, transport) = setup(config);
    connect(&engine, &events, &transport);
    let disconnects = transport.disconnect_calls();

    engine.ping(Token(50)).unwrap();
    assert!(transport
        .written_packets()
        .iter()
        .any(|p| matches!(p, Packet::Pingreq)));

    let error = events
        .network_error
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(error.message_type, PacketType::Pingreq);
    assert!(matches!(error.error, ClientError::NotResponding));
    assert!(transport.disconnect_calls() > disconnects);
    assert_eq!(engine.session_state(), SessionState::Idle);
}

#[test]
fn pending_publish_timeout_leaves_session_up() {
    let config = ProtocolConfig::default().network_timeout(Duration::from_millis(500));
    let (engine, events, transport) = setup(config);
    connect(&engine, &events, &transport);

    let message_id = engine
        .publish("a/b", Bytes::from_static(b"hi"), QoS::AtLeastOnce, false, Token(60))
        .unwrap()
        .unwrap();

    let error = events
        .network_error
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(error.message_type, PacketType::Publish);
    assert_eq!(error.message_id, message_id);

    // Unlike CONNECT and PINGREQ timeouts, the session stays connected.
    assert!(engine.is_connected());
    assert_eq!(engine.pending_count(), 0);

    // The late response now matches nothing.
    let baseline = engine.unmatched_responses();
    transport.inject(Packet::Puback { message_id });
    assert_eq!(engine.unmatched_responses(), baseline + 1);
    assert!(events.send_complete.try_recv().is_err());
}
