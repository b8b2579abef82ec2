//! Subscription registry and inbound publish dispatch.

use std::sync::Arc;

use parking_lot::Mutex;
use wrenmq_core::packet::{Publish, QoS};
use wrenmq_core::topic;

use crate::error::ClientError;
use crate::events::Token;

/// Callback invoked for each publish whose topic matches the subscription
/// filter. Runs on the engine's receive path; keep it short.
pub type PublishHandler = Arc<dyn Fn(&Publish) + Send + Sync>;

struct Entry {
    filter: String,
    qos: QoS,
    /// Correlation token supplied at registration, carried on every
    /// SUBSCRIBE this entry produces, deferred ones included.
    token: Option<Token>,
    handler: PublishHandler,
    /// Whether a SUBSCRIBE for this filter has gone out on the current
    /// connection.
    active: bool,
}

/// The set of registered subscriptions, unique by filter.
///
/// Registration is independent of connection state: entries added while
/// idle are subscribed on the wire when the session reaches Connected, and
/// every entry is marked inactive again when the connection closes so a
/// reconnect re-subscribes them.
#[derive(Default)]
pub struct SubscriptionSet {
    entries: Mutex<Vec<Entry>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        filter: &str,
        qos: QoS,
        token: Option<Token>,
        handler: PublishHandler,
    ) -> Result<(), ClientError> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|entry| entry.filter == filter) {
            return Err(ClientError::DuplicateSubscription(filter.to_string()));
        }
        entries.push(Entry {
            filter: filter.to_string(),
            qos,
            token,
            handler,
            active: false,
        });
        Ok(())
    }

    /// Remove the entry for `filter`. Returns whether it existed.
    pub fn remove(&self, filter: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.filter != filter);
        entries.len() != before
    }

    pub fn activate(&self, filter: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.filter == filter) {
            entry.active = true;
        }
    }

    pub fn deactivate_all(&self) {
        for entry in self.entries.lock().iter_mut() {
            entry.active = false;
        }
    }

    /// Filters that still need a SUBSCRIBE on the current connection, each
    /// with the token it was registered under.
    pub fn inactive(&self) -> Vec<(String, QoS, Option<Token>)> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| !entry.active)
            .map(|entry| (entry.filter.clone(), entry.qos, entry.token))
            .collect()
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.filter == filter)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every matching handler for `publish`. Returns whether at least
    /// one subscription matched.
    pub fn dispatch(&self, publish: &Publish) -> bool {
        // Snapshot handlers so a callback can re-enter the engine without
        // holding the registry lock.
        let matching: Vec<PublishHandler> = self
            .entries
            .lock()
            .iter()
            .filter(|entry| topic::is_match(&entry.filter, &publish.topic))
            .map(|entry| Arc::clone(&entry.handler))
            .collect();

        for handler in &matching {
            handler(publish);
        }
        !matching.is_empty()
    }
}
