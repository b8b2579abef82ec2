//! Pending request store.
//!
//! Every packet that expects a response is parked here between the write and
//! the arrival of that response. Entries are keyed by the response type, the
//! message id, and the session, so a PUBACK for id 5 can never complete a
//! SUBSCRIBE with the same id, and a stale response from a previous session
//! cannot complete a request from the current one.
//!
//! A single background thread watches deadlines. Expiry removes the entry
//! under the same lock `remove` takes, so a response racing its timeout
//! resolves to exactly one outcome: the remove wins and no timeout fires, or
//! the timeout wins and the remove finds nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use wrenmq_core::packet::{Packet, PacketType, Publish};

use crate::events::{SessionId, Token};

/// Correlation payload riding on a pending entry.
///
/// Most entries carry the caller's token. The receiver side of the QoS 2
/// handshake instead parks the inbound PUBLISH on the PUBREC entry, so the
/// message is still at hand when PUBREL arrives.
#[derive(Debug, Clone)]
pub enum PendingData {
    None,
    Token(Token),
    InboundPublish(Publish),
}

impl PendingData {
    pub fn token(&self) -> Option<Token> {
        match self {
            PendingData::Token(token) => Some(*token),
            _ => None,
        }
    }

    pub fn into_publish(self) -> Option<Publish> {
        match self {
            PendingData::InboundPublish(publish) => Some(publish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    response: PacketType,
    message_id: u16,
    session: SessionId,
}

struct Entry {
    packet: Packet,
    data: PendingData,
    retries: u32,
    deadline: Instant,
}

/// A pending request whose deadline elapsed.
#[derive(Debug)]
pub struct MessageTimeout {
    /// The request that went unanswered.
    pub packet: Packet,
    pub data: PendingData,
    pub retries: u32,
    pub session: SessionId,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    timeout: Duration,
}

struct State {
    entries: HashMap<PendingKey, Entry>,
    shutdown: bool,
}

pub struct PendingStore {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PendingStore {
    /// Create a store whose entries expire after `timeout`. Expired entries
    /// are reported on `timeouts`.
    pub fn new(timeout: Duration, timeouts: Sender<MessageTimeout>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: HashMap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            timeout,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || expiry_loop(worker_shared, timeouts));

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Track `packet` until its response arrives or the deadline passes.
    ///
    /// Packets that expect no response are not tracked; the call is a
    /// silent no-op for them.
    pub fn add(&self, packet: Packet, data: PendingData, retries: u32, session: &SessionId) {
        let Some(response) = packet.expected_response() else {
            return;
        };
        let key = PendingKey {
            response,
            message_id: packet.message_id_or_default(),
            session: session.clone(),
        };
        let deadline = Instant::now() + self.shared.timeout;
        let mut state = self.shared.state.lock();
        state.entries.insert(
            key,
            Entry {
                packet,
                data,
                retries,
                deadline,
            },
        );
        self.shared.wake.notify_one();
    }

    /// Complete the entry matching an arrived response. Returns the parked
    /// request and its correlation data, or `None` when nothing matches, be
    /// it because the entry timed out, the session was cleared, or the
    /// response was never asked for.
    pub fn remove(
        &self,
        response: PacketType,
        message_id: u16,
        session: &SessionId,
    ) -> Option<(Packet, PendingData)> {
        let key = PendingKey {
            response,
            message_id,
            session: session.clone(),
        };
        self.shared
            .state
            .lock()
            .entries
            .remove(&key)
            .map(|entry| (entry.packet, entry.data))
    }

    /// Drop every entry belonging to `session` without firing timeouts.
    pub fn clear_session(&self, session: &SessionId) {
        self.shared
            .state
            .lock()
            .entries
            .retain(|key, _| key.session != *session);
    }

    /// Drop all entries without firing timeouts.
    pub fn clear_all(&self) {
        self.shared.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, response: PacketType, message_id: u16, session: &SessionId) -> bool {
        let key = PendingKey {
            response,
            message_id,
            session: session.clone(),
        };
        self.shared.state.lock().entries.contains_key(&key)
    }
}

impl Drop for PendingStore {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn expiry_loop(shared: Arc<Shared>, timeouts: Sender<MessageTimeout>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let expired: Vec<PendingKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        if !expired.is_empty() {
            let mut fired = Vec::with_capacity(expired.len());
            for key in expired {
                if let Some(entry) = state.entries.remove(&key) {
                    fired.push(MessageTimeout {
                        packet: entry.packet,
                        data: entry.data,
                        retries: entry.retries,
                        session: key.session,
                    });
                }
            }
            // Deliver outside the lock so a receiver may call back into the
            // store.
            MutexGuard::unlocked(&mut state, || {
                for event in fired {
                    let _ = timeouts.send(event);
                }
            });
            continue;
        }

        match state.entries.values().map(|entry| entry.deadline).min() {
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
            None => {
                shared.wake.wait(&mut state);
            }
        }
    }
}
