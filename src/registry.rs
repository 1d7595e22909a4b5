//! Concurrent registry of connected clients, keyed by callsign.
//!
//! Keyed on `DashMap` rather than a single `Mutex<HashMap<..>>` so one
//! client's position update doesn't block every other client's lookup -
//! the same tradeoff made for per-aircraft state elsewhere in this crate.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::broadcast::BroadcastChecker;
use crate::client::Client;

pub type Callsign = Vec<u8>;

/// A message queued for a connection's owning task to act on: either
/// bytes to write verbatim (CRLF already appended by the caller) or an
/// instruction to tear the connection down, used by `$!!` kill handling
/// to close a connection this task doesn't itself own.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Write(Vec<u8>),
    Close,
}

/// Queues a message for delivery to one connection's own task.
pub type OutboundSender = UnboundedSender<OutboundMessage>;

/// Shared client table. Cheap to clone - every clone points at the same
/// underlying maps.
///
/// Client state and outbound delivery are tracked separately: `Client` is
/// plain, cloneable data (used for broadcast-matching snapshots), while
/// each session's actual socket write half lives on its own task and is
/// reached only through the matching `OutboundSender` here.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: Arc<DashMap<Callsign, Client>>,
    senders: Arc<DashMap<Callsign, OutboundSender>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            senders: Arc::new(DashMap::new()),
        }
    }

    pub fn contains(&self, callsign: &[u8]) -> bool {
        self.clients.contains_key(callsign)
    }

    pub fn insert(&self, client: Client, sender: OutboundSender) {
        self.senders.insert(client.callsign.clone(), sender);
        self.clients.insert(client.callsign.clone(), client);
    }

    pub fn remove(&self, callsign: &[u8]) -> Option<Client> {
        self.senders.remove(callsign);
        self.clients.remove(callsign).map(|(_, client)| client)
    }

    /// Queue `packet` for delivery to `callsign`'s connection. `packet`
    /// must already carry its trailing CRLF. Returns `false` if no such
    /// client is connected or its task has already dropped the receiving
    /// half.
    pub fn send_to(&self, callsign: &[u8], packet: Vec<u8>) -> bool {
        match self.senders.get(callsign) {
            Some(sender) => sender.send(OutboundMessage::Write(packet)).is_ok(),
            None => false,
        }
    }

    /// Ask `callsign`'s own task to tear its connection down, used by
    /// `$!!` kill handling where the killer isn't the owning task.
    pub fn close(&self, callsign: &[u8]) -> bool {
        match self.senders.get(callsign) {
            Some(sender) => sender.send(OutboundMessage::Close).is_ok(),
            None => false,
        }
    }

    pub fn get(&self, callsign: &[u8]) -> Option<Client> {
        self.clients.get(callsign).map(|entry| entry.value().clone())
    }

    /// Mutate a client in place without holding the shard guard across an
    /// await point - callers pass a synchronous closure and the guard is
    /// dropped before this call returns.
    pub fn update<F: FnOnce(&mut Client)>(&self, callsign: &[u8], f: F) -> bool {
        if let Some(mut entry) = self.clients.get_mut(callsign) {
            f(entry.value_mut());
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of every client currently registered. Used for broadcast
    /// fan-out, where we need to iterate without holding the map locked
    /// while each recipient's connection is written to.
    pub fn snapshot(&self) -> Vec<Client> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Callsigns of clients for which `checker(from, candidate)` holds.
    pub fn matching(&self, from: &Client, checker: impl Fn(&Client, &Client) -> bool) -> Vec<Callsign> {
        self.clients
            .iter()
            .filter(|entry| entry.key() != &from.callsign && checker(from, entry.value()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Callsigns of clients for which a [`BroadcastChecker`] function
    /// pointer holds - a thin convenience over [`Self::matching`] for
    /// call sites that already have a `fn` rather than a closure.
    pub fn matching_fn(&self, from: &Client, checker: BroadcastChecker) -> Vec<Callsign> {
        self.matching(from, checker)
    }
}
