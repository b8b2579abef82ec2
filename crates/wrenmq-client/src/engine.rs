//! The client protocol engine.
//!
//! Owns the session state machine, drives the QoS handshakes in both
//! directions, and ties the pending store, keep-alive timer, and
//! subscription registry to a [`Transport`]. All completions flow through
//! the channels handed out at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::unbounded;
use log::{debug, info, warn};
use parking_lot::Mutex;
use wrenmq_core::packet::{
    self, Connack, Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, Subscribe,
    Unsubscribe, Will, DEFAULT_MESSAGE_ID,
};
use wrenmq_core::{validate, ProtocolError};

use crate::config::ProtocolConfig;
use crate::error::{ClientError, Result};
use crate::events::{
    ConnectComplete, EngineEvents, EventSenders, NetworkError, SendComplete, SessionId,
    SessionState, SubscribeComplete, Token,
};
use crate::store::{MessageTimeout, PendingData, PendingStore};
use crate::subscription::{PublishHandler, SubscriptionSet};
use crate::timer::KeepAliveTimer;
use crate::transport::{Encryption, Transport};

/// Options for a single connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<Will>,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            username: None,
            password: None,
            will: None,
        }
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }
}

struct EngineState {
    phase: SessionState,
    session: SessionId,
    next_message_id: u16,
}

/// Client-side MQTT 3.1 protocol engine.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: ProtocolConfig,
    transport: Arc<dyn Transport>,
    store: PendingStore,
    subscriptions: SubscriptionSet,
    keep_alive: KeepAliveTimer,
    state: Mutex<EngineState>,
    events: EventSenders,
    unmatched_responses: AtomicU64,
    decode_failures: AtomicU64,
}

impl ProtocolEngine {
    /// Wire an engine to `transport` and hand back the completion channels.
    ///
    /// The engine installs the transport's receive callback here, so the
    /// transport must not be connected yet.
    pub fn new(config: ProtocolConfig, transport: Arc<dyn Transport>) -> (Self, EngineEvents) {
        let (senders, events) = EventSenders::channels();
        let (timeout_tx, timeout_rx) = unbounded();

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let timer_weak = weak.clone();
            let keep_alive = KeepAliveTimer::new(
                config.keep_alive_interval(),
                Box::new(move || {
                    if let Some(engine) = timer_weak.upgrade() {
                        engine.send_keep_alive_ping();
                    }
                }),
            );

            EngineInner {
                store: PendingStore::new(config.network_timeout, timeout_tx),
                subscriptions: SubscriptionSet::new(),
                keep_alive,
                state: Mutex::new(EngineState {
                    phase: SessionState::Idle,
                    session: Arc::from(""),
                    next_message_id: 0,
                }),
                events: senders,
                unmatched_responses: AtomicU64::new(0),
                decode_failures: AtomicU64::new(0),
                transport,
                config,
            }
        });

        let receive_weak = Arc::downgrade(&inner);
        inner
            .transport
            .set_receive_callback(Box::new(move |result| {
                if let Some(engine) = receive_weak.upgrade() {
                    engine.handle_inbound(result);
                }
            }));

        // Applies the per-packet-type timeout policy. The channel closes
        // when the store (and with it the engine) is dropped.
        let policy_weak = Arc::downgrade(&inner);
        thread::spawn(move || {
            while let Ok(event) = timeout_rx.recv() {
                match policy_weak.upgrade() {
                    Some(engine) => engine.handle_timeout(event),
                    None => break,
                }
            }
        });

        (Self { inner }, events)
    }

    /// Open the transport and send CONNECT.
    ///
    /// Field validation happens before any transport activity; a validation
    /// failure is returned directly and nothing is sent. Everything after
    /// that completes through the connect-complete channel.
    pub fn connect(
        &self,
        options: ConnectOptions,
        host: &str,
        port: u16,
        encryption: Encryption,
        token: Token,
    ) -> Result<()> {
        EngineInner::connect(&self.inner, options, host.to_string(), port, encryption, token)
    }

    /// Publish to `topic`. For QoS above 0 the allocated message id is
    /// returned and the publish completes through the send-complete channel
    /// once the handshake finishes.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        token: Token,
    ) -> Result<Option<u16>> {
        self.inner.publish(topic, payload.into(), qos, retain, token)
    }

    /// Register `handler` for `filter` and subscribe on the wire.
    ///
    /// May be called before connecting; the SUBSCRIBE then goes out when
    /// the session reaches Connected, still carrying `token`. Filters are
    /// unique per engine.
    pub fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        token: Token,
        handler: PublishHandler,
    ) -> Result<()> {
        self.inner.subscribe(filter, qos, token, handler)
    }

    /// Drop the subscription for `filter` and, when connected, send
    /// UNSUBSCRIBE.
    pub fn unsubscribe(&self, filter: &str, token: Token) -> Result<()> {
        self.inner.unsubscribe(filter, token)
    }

    /// Send PINGREQ, tracked like any other pending request.
    pub fn ping(&self, token: Token) -> Result<()> {
        self.inner.ensure_connected()?;
        self.inner
            .send_packet(Packet::Pingreq, PendingData::Token(token))
    }

    /// Send DISCONNECT and close the connection. The connection closes
    /// whether or not the final write succeeds.
    pub fn disconnect(&self, token: Token) -> Result<()> {
        self.inner.disconnect(token)
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().phase == SessionState::Connected
    }

    /// Requests still waiting on a response.
    pub fn pending_count(&self) -> usize {
        self.inner.store.len()
    }

    /// Responses that arrived with no matching pending request. They are
    /// dropped by design; this counter keeps the drops observable.
    pub fn unmatched_responses(&self) -> u64 {
        self.inner.unmatched_responses.load(Ordering::Relaxed)
    }

    /// Inbound frames the codec rejected.
    pub fn decode_failures(&self) -> u64 {
        self.inner.decode_failures.load(Ordering::Relaxed)
    }
}

impl EngineInner {
    fn connect(
        self: &Arc<Self>,
        options: ConnectOptions,
        host: String,
        port: u16,
        encryption: Encryption,
        token: Token,
    ) -> Result<()> {
        let connect = Connect {
            clean_session: options.clean_session,
            keep_alive: self.config.keep_alive_secs,
            client_id: options.client_id.clone(),
            will: options.will,
            username: options.username.clone(),
            password: options.password,
        };
        let request = Packet::Connect(connect);
        // Validate every field up front; nothing reaches the transport on
        // failure.
        packet::encode_packet(&request, self.config.max_message_size)?;

        let session = derive_session_id(&options.client_id, options.username.as_deref());
        {
            let mut state = self.state.lock();
            if state.phase != SessionState::Idle {
                return Err(ClientError::InvalidState("connect requires an idle session"));
            }
            state.phase = SessionState::Connecting;
            state.session = session.clone();
            state.next_message_id = 0;
        }

        info!("connecting to {}:{} as {}", host, port, session);
        let engine = Arc::clone(self);
        thread::spawn(move || {
            match engine.transport.connect(&host, port, encryption) {
                Ok(()) => {
                    if let Err(e) = engine.send_packet(request, PendingData::Token(token)) {
                        // Only validation can fail here and it already
                        // passed; still, leave no dangling state behind.
                        warn!("connect send failed: {}", e);
                    }
                }
                Err(e) => {
                    engine.state.lock().phase = SessionState::Idle;
                    engine.events.connect_complete(ConnectComplete {
                        session,
                        token: Some(token),
                        result: Err(e.into()),
                    });
                }
            }
        });
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        token: Token,
    ) -> Result<Option<u16>> {
        self.ensure_connected()?;
        let message_id = if qos > QoS::AtMostOnce {
            Some(self.next_message_id())
        } else {
            None
        };
        let request = Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            message_id,
            payload,
        });
        self.send_packet(request, PendingData::Token(token))?;
        Ok(message_id)
    }

    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        token: Token,
        handler: PublishHandler,
    ) -> Result<()> {
        validate::validate_required_string(filter, "topic filter")?;
        self.subscriptions.insert(filter, qos, Some(token), handler)?;
        if self.state.lock().phase == SessionState::Connected {
            self.send_subscribe(filter, qos, Some(token))?;
        }
        Ok(())
    }

    fn send_subscribe(&self, filter: &str, qos: QoS, token: Option<Token>) -> Result<()> {
        let message_id = self.next_message_id();
        let request = Packet::Subscribe(Subscribe {
            message_id,
            topics: vec![(filter.to_string(), qos)],
        });
        self.subscriptions.activate(filter);
        let data = match token {
            Some(token) => PendingData::Token(token),
            None => PendingData::None,
        };
        self.send_packet(request, data)
    }

    fn unsubscribe(&self, filter: &str, token: Token) -> Result<()> {
        let existed = self.subscriptions.remove(filter);
        if existed && self.state.lock().phase == SessionState::Connected {
            let message_id = self.next_message_id();
            let request = Packet::Unsubscribe(Unsubscribe {
                message_id,
                topics: vec![filter.to_string()],
            });
            self.send_packet(request, PendingData::Token(token))?;
        }
        Ok(())
    }

    fn disconnect(&self, token: Token) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.phase != SessionState::Connected {
                return Err(ClientError::NotConnected);
            }
            state.phase = SessionState::Disconnecting;
        }
        self.send_packet(Packet::Disconnect, PendingData::Token(token))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state.lock().phase == SessionState::Connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    fn next_message_id(&self) -> u16 {
        let mut state = self.state.lock();
        state.next_message_id = state.next_message_id.wrapping_add(1);
        if state.next_message_id == 0 {
            state.next_message_id = 1;
        }
        state.next_message_id
    }

    /// Encode, register the pending entry, then write.
    ///
    /// Registration happens before the write so the response cannot arrive
    /// ahead of its entry; a failed write rolls the entry back and routes
    /// the error to the request's completion channel.
    fn send_packet(&self, request: Packet, data: PendingData) -> Result<()> {
        let bytes = packet::encode_packet(&request, self.config.max_message_size)?;
        let session = self.state.lock().session.clone();
        let message_type = request.packet_type();
        let message_id = request.message_id_or_default();
        let response = request.expected_response();
        let token = data.token();

        if response.is_some() {
            self.store
                .add(request, data, self.config.max_retry_count, &session);
        }

        debug!("sending {:?} id {}", message_type, message_id);
        match self.transport.write(&bytes) {
            Ok(()) => {
                match message_type {
                    PacketType::Connect => {
                        // The keep-alive clock starts with the session.
                        self.keep_alive.start(self.config.keep_alive_interval());
                    }
                    PacketType::Disconnect => {
                        self.close_connection();
                        self.events.send_complete(SendComplete {
                            message_type,
                            message_id,
                            token,
                            result: Ok(()),
                        });
                    }
                    _ => {
                        self.keep_alive.reset();
                        if response.is_none() {
                            self.events.send_complete(SendComplete {
                                message_type,
                                message_id,
                                token,
                                result: Ok(()),
                            });
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                if let Some(response) = response {
                    self.store.remove(response, message_id, &session);
                }
                warn!("write of {:?} id {} failed: {}", message_type, message_id, e);
                match message_type {
                    PacketType::Connect => {
                        self.close_connection();
                        self.events.connect_complete(ConnectComplete {
                            session,
                            token,
                            result: Err(e.into()),
                        });
                    }
                    PacketType::Subscribe => {
                        self.events.subscribe_complete(SubscribeComplete {
                            token,
                            result: Err(e.into()),
                        });
                    }
                    PacketType::Disconnect => {
                        self.close_connection();
                        self.events.send_complete(SendComplete {
                            message_type,
                            message_id,
                            token,
                            result: Err(e.into()),
                        });
                    }
                    _ => {
                        self.events.send_complete(SendComplete {
                            message_type,
                            message_id,
                            token,
                            result: Err(e.into()),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Stop the keep-alive, tear down the transport, and drop everything
    /// still pending for this session. Dropped entries fire no timeouts.
    fn close_connection(&self) {
        self.keep_alive.stop();
        self.transport.disconnect();
        let session = {
            let mut state = self.state.lock();
            state.phase = SessionState::Idle;
            state.session.clone()
        };
        self.store.clear_session(&session);
        self.subscriptions.deactivate_all();
        info!("connection closed for {}", session);
    }

    fn send_keep_alive_ping(&self) {
        if self.state.lock().phase != SessionState::Connected {
            return;
        }
        debug!("keep-alive interval elapsed, pinging");
        if let Err(e) = self.send_packet(Packet::Pingreq, PendingData::None) {
            warn!("keep-alive ping failed: {}", e);
        }
    }

    fn handle_inbound(&self, result: std::result::Result<Packet, ProtocolError>) {
        let received = match result {
            Ok(received) => received,
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!("dropping undecodable frame: {}", e);
                return;
            }
        };

        let session = self.state.lock().session.clone();
        debug!("received {:?}", received.packet_type());

        match received {
            Packet::Connack(ack) => self.handle_connack(ack, &session),
            Packet::Suback(ack) => {
                if let Some((_, data)) =
                    self.take_pending(PacketType::Suback, ack.message_id, &session)
                {
                    self.events.subscribe_complete(SubscribeComplete {
                        token: data.token(),
                        result: Ok(ack),
                    });
                }
            }
            Packet::Puback { message_id } => {
                self.complete_send(PacketType::Puback, message_id, &session)
            }
            Packet::Pubcomp { message_id } => {
                self.complete_send(PacketType::Pubcomp, message_id, &session)
            }
            Packet::Unsuback { message_id } => {
                self.complete_send(PacketType::Unsuback, message_id, &session)
            }
            Packet::Pingresp => {
                self.complete_send(PacketType::Pingresp, DEFAULT_MESSAGE_ID, &session)
            }
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::Pubrec { message_id } => {
                // Second leg of the outbound QoS 2 handshake; the token
                // rides along to the PUBREL entry.
                if let Some((_, data)) =
                    self.take_pending(PacketType::Pubrec, message_id, &session)
                {
                    if let Err(e) = self.send_packet(Packet::Pubrel { message_id }, data) {
                        warn!("PUBREL for id {} failed: {}", message_id, e);
                    }
                }
            }
            Packet::Pubrel { message_id } => {
                // Final inbound leg of the receiver-side QoS 2 handshake:
                // acknowledge, then release the parked publish.
                if let Some((_, data)) =
                    self.take_pending(PacketType::Pubrel, message_id, &session)
                {
                    if let Err(e) = self.send_packet(Packet::Pubcomp { message_id }, PendingData::None)
                    {
                        warn!("PUBCOMP for id {} failed: {}", message_id, e);
                    }
                    if let Some(publish) = data.into_publish() {
                        self.deliver(publish);
                    }
                }
            }
            other => {
                debug!("ignoring unexpected {:?}", other.packet_type());
            }
        }
    }

    fn handle_connack(&self, ack: Connack, session: &SessionId) {
        let Some((_, data)) = self.take_pending(PacketType::Connack, DEFAULT_MESSAGE_ID, session)
        else {
            return;
        };
        let token = data.token();

        if ack.return_code == ConnectReturnCode::Accepted {
            self.state.lock().phase = SessionState::Connected;
            info!("session {} connected", session);
            self.resubscribe();
            self.events.connect_complete(ConnectComplete {
                session: session.clone(),
                token,
                result: Ok(()),
            });
        } else {
            warn!("broker refused connection: {:?}", ack.return_code);
            self.close_connection();
            self.events.connect_complete(ConnectComplete {
                session: session.clone(),
                token,
                result: Err(ClientError::ConnectionRefused(ack.return_code)),
            });
        }
    }

    /// Subscribe every registered filter that is not yet live on this
    /// connection, each under its registration token. Covers both
    /// subscribe-before-connect and reconnects.
    fn resubscribe(&self) {
        for (filter, qos, token) in self.subscriptions.inactive() {
            if let Err(e) = self.send_subscribe(&filter, qos, token) {
                warn!("re-subscribe of {} failed: {}", filter, e);
            }
        }
    }

    fn handle_publish(&self, publish: Publish) {
        match publish.qos {
            QoS::AtMostOnce => self.deliver(publish),
            QoS::AtLeastOnce => {
                let message_id = publish.message_id.unwrap_or(DEFAULT_MESSAGE_ID);
                if let Err(e) = self.send_packet(Packet::Puback { message_id }, PendingData::None)
                {
                    warn!("PUBACK for id {} failed: {}", message_id, e);
                }
                self.deliver(publish);
            }
            QoS::ExactlyOnce => {
                // Delivery waits for PUBREL; until then the publish rides
                // the pending PUBREC entry.
                let message_id = publish.message_id.unwrap_or(DEFAULT_MESSAGE_ID);
                if let Err(e) = self.send_packet(
                    Packet::Pubrec { message_id },
                    PendingData::InboundPublish(publish),
                ) {
                    warn!("PUBREC for id {} failed: {}", message_id, e);
                }
            }
        }
    }

    fn deliver(&self, publish: Publish) {
        if !self.subscriptions.dispatch(&publish) {
            debug!("no subscription matched topic {}", publish.topic);
            self.events.publish_received(publish);
        }
    }

    fn complete_send(&self, response: PacketType, message_id: u16, session: &SessionId) {
        if let Some((request, data)) = self.take_pending(response, message_id, session) {
            self.events.send_complete(SendComplete {
                message_type: request.packet_type(),
                message_id,
                token: data.token(),
                result: Ok(()),
            });
        }
    }

    /// Pop the pending entry a response matches. Unmatched responses are
    /// dropped, counted, and logged.
    fn take_pending(
        &self,
        response: PacketType,
        message_id: u16,
        session: &SessionId,
    ) -> Option<(Packet, PendingData)> {
        let entry = self.store.remove(response, message_id, session);
        if entry.is_none() {
            self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
            warn!("no pending request for {:?} id {}", response, message_id);
        }
        entry
    }

    /// Per-packet-type timeout policy.
    ///
    /// A CONNECT timeout fails the connect attempt and closes the
    /// connection; the failure reaches the caller on the connect-complete
    /// channel alone. A PINGREQ timeout means the line is dead, so it also
    /// closes the connection. Everything else reports the loss and leaves
    /// the session up.
    fn handle_timeout(&self, event: MessageTimeout) {
        let message_type = event.packet.packet_type();
        let message_id = event.packet.message_id_or_default();
        warn!(
            "{:?} id {} timed out after {:?}",
            message_type, message_id, self.config.network_timeout
        );

        match message_type {
            PacketType::Connect => {
                self.close_connection();
                self.events.connect_complete(ConnectComplete {
                    session: event.session,
                    token: event.data.token(),
                    result: Err(ClientError::NotResponding),
                });
            }
            PacketType::Pingreq => {
                self.close_connection();
                self.events.network_error(NetworkError {
                    message_type,
                    message_id,
                    error: ClientError::NotResponding,
                });
            }
            _ => {
                self.events.network_error(NetworkError {
                    message_type,
                    message_id,
                    error: ClientError::NotResponding,
                });
            }
        }
    }
}

/// Session identity: the client id, qualified by the username when one is
/// set, so the same device connecting under different accounts keeps its
/// pending requests apart.
fn derive_session_id(client_id: &str, username: Option<&str>) -> SessionId {
    match username {
        Some(username) if !username.is_empty() => {
            Arc::from(format!("{}-{}", client_id, username))
        }
        _ => Arc::from(client_id),
    }
}
