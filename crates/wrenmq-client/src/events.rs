//! Completion events and the channels that carry them.
//!
//! Every network-facing operation completes through one of five channels,
//! split by category so a caller can service just the traffic it cares
//! about. Events carry the correlation token the caller supplied with the
//! request.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use wrenmq_core::packet::{PacketType, Publish, Suback};

use crate::error::ClientError;

/// Caller-supplied correlation token, returned on the completion event for
/// the request it was attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Identifies the logical session a pending request belongs to. Derived
/// from the client id, qualified by the username when one is set.
pub type SessionId = Arc<str>;

/// Lifecycle of the engine's single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Outcome of a connect attempt.
#[derive(Debug)]
pub struct ConnectComplete {
    pub session: SessionId,
    pub token: Option<Token>,
    pub result: Result<(), ClientError>,
}

/// Outcome of a SUBSCRIBE request, carrying the granted QoS on success.
#[derive(Debug)]
pub struct SubscribeComplete {
    pub token: Option<Token>,
    pub result: Result<Suback, ClientError>,
}

/// Outcome of any other send. For request/response packets this fires when
/// the response arrives; fire-and-forget packets complete as soon as the
/// write succeeds. A QoS 2 publish completes on PUBCOMP, reported against
/// the PUBREL leg of the handshake.
#[derive(Debug)]
pub struct SendComplete {
    pub message_type: PacketType,
    pub message_id: u16,
    pub token: Option<Token>,
    pub result: Result<(), ClientError>,
}

/// A pending request timed out, or the connection failed out-of-band.
#[derive(Debug)]
pub struct NetworkError {
    pub message_type: PacketType,
    pub message_id: u16,
    pub error: ClientError,
}

/// Receiving ends of the engine's completion channels.
///
/// Inbound publishes that no registered subscription handles arrive on
/// `publish_received`.
pub struct EngineEvents {
    pub connect_complete: Receiver<ConnectComplete>,
    pub subscribe_complete: Receiver<SubscribeComplete>,
    pub send_complete: Receiver<SendComplete>,
    pub publish_received: Receiver<Publish>,
    pub network_error: Receiver<NetworkError>,
}

/// Sending ends held by the engine. Sends ignore a dropped receiver; the
/// caller opting out of a channel must not stall the protocol.
pub(crate) struct EventSenders {
    connect_complete: Sender<ConnectComplete>,
    subscribe_complete: Sender<SubscribeComplete>,
    send_complete: Sender<SendComplete>,
    publish_received: Sender<Publish>,
    network_error: Sender<NetworkError>,
}

impl EventSenders {
    pub(crate) fn channels() -> (EventSenders, EngineEvents) {
        let (connect_tx, connect_rx) = unbounded();
        let (subscribe_tx, subscribe_rx) = unbounded();
        let (send_tx, send_rx) = unbounded();
        let (publish_tx, publish_rx) = unbounded();
        let (error_tx, error_rx) = unbounded();
        (
            EventSenders {
                connect_complete: connect_tx,
                subscribe_complete: subscribe_tx,
                send_complete: send_tx,
                publish_received: publish_tx,
                network_error: error_tx,
            },
            EngineEvents {
                connect_complete: connect_rx,
                subscribe_complete: subscribe_rx,
                send_complete: send_rx,
                publish_received: publish_rx,
                network_error: error_rx,
            },
        )
    }

    pub(crate) fn connect_complete(&self, event: ConnectComplete) {
        let _ = self.connect_complete.send(event);
    }

    pub(crate) fn subscribe_complete(&self, event: SubscribeComplete) {
        let _ = self.subscribe_complete.send(event);
    }

    pub(crate) fn send_complete(&self, event: SendComplete) {
        let _ = self.send_complete.send(event);
    }

    pub(crate) fn publish_received(&self, publish: Publish) {
        let _ = self.publish_received.send(publish);
    }

    pub(crate) fn network_error(&self, event: NetworkError) {
        let _ = self.network_error.send(event);
    }
}
