//! Live-connection registry.
//!
//! Tracks checked-in conversations, their registered application-service
//! channels, and active relay pairs. Entries are weak lookups by
//! connection id; they never outlive the conversation task that created
//! them and the whole registry dies with the process.

use std::collections::HashMap;

use tokio::sync::mpsc;

use homenet_types::IdentityId;

/// Identifies one live conversation.
pub type ConnId = u64;

/// Events delivered to a conversation task from its relay peer.
#[derive(Debug)]
pub enum RelayEvent {
    /// This conversation was paired; it is now RELAYING.
    Paired { peer: ConnId },
    /// Opaque bytes from the paired peer.
    Data(Vec<u8>),
    /// The paired peer went away; the relay is torn down.
    PeerClosed,
}

/// Why a call could not be placed.
#[derive(Debug, PartialEq, Eq)]
pub enum CallError {
    /// No checked-in conversation has the channel registered.
    NotFound,
    /// The callee is already relaying.
    Busy,
}

struct ConnEntry {
    relay_tx: mpsc::Sender<RelayEvent>,
    identity: Option<IdentityId>,
    paired_with: Option<ConnId>,
}

#[derive(Default)]
struct Inner {
    next_id: ConnId,
    conns: HashMap<ConnId, ConnEntry>,
    /// (identity, channel name) -> conversation that registered it.
    channels: HashMap<(IdentityId, String), ConnId>,
}

/// The registry. All methods take `&self`; a plain mutex guards the maps
/// and every critical section is short.
#[derive(Default)]
pub struct Registry {
    inner: std::sync::Mutex<Inner>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned registry mutex means a panic mid-update; the maps
        // hold only weak lookups, so continuing with them is safe.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new conversation and return its id.
    pub fn register(&self, relay_tx: mpsc::Sender<RelayEvent>) -> ConnId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.conns.insert(
            id,
            ConnEntry {
                relay_tx,
                identity: None,
                paired_with: None,
            },
        );
        id
    }

    /// Record the identity a conversation checked in as.
    pub fn set_identity(&self, conn: ConnId, identity: IdentityId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.conns.get_mut(&conn) {
            entry.identity = Some(identity);
        }
    }

    /// Register application-service channels for a checked-in conversation.
    /// Re-registering a name takes it over (last registration wins).
    pub fn add_channels(&self, conn: ConnId, identity: IdentityId, names: &[String]) {
        let mut inner = self.lock();
        for name in names {
            inner.channels.insert((identity, name.clone()), conn);
        }
    }

    /// Pair a caller with the conversation that registered
    /// (callee, service_name). Both ends receive no data yet; the callee
    /// gets a [`RelayEvent::Paired`] and the caller learns the peer id
    /// from the return value.
    pub fn call(
        &self,
        caller: ConnId,
        callee: &IdentityId,
        service_name: &str,
    ) -> std::result::Result<ConnId, CallError> {
        let mut inner = self.lock();
        let target = match inner.channels.get(&(*callee, service_name.to_string())) {
            Some(id) => *id,
            None => return Err(CallError::NotFound),
        };
        if target == caller {
            return Err(CallError::NotFound);
        }

        let target_tx = match inner.conns.get(&target) {
            Some(entry) if entry.paired_with.is_none() => entry.relay_tx.clone(),
            Some(_) => return Err(CallError::Busy),
            None => return Err(CallError::NotFound),
        };
        match inner.conns.get(&caller) {
            Some(entry) if entry.paired_with.is_none() => {}
            _ => return Err(CallError::Busy),
        }

        if let Some(entry) = inner.conns.get_mut(&caller) {
            entry.paired_with = Some(target);
        }
        if let Some(entry) = inner.conns.get_mut(&target) {
            entry.paired_with = Some(caller);
        }
        drop(inner);

        // Best effort: if the callee's queue is gone it will unregister
        // itself shortly and the relay collapses.
        let _ = target_tx.try_send(RelayEvent::Paired { peer: caller });
        Ok(target)
    }

    /// The sender half of a conversation's relay queue.
    pub fn relay_sender(&self, conn: ConnId) -> Option<mpsc::Sender<RelayEvent>> {
        self.lock().conns.get(&conn).map(|e| e.relay_tx.clone())
    }

    /// The conversation currently paired with `conn`.
    pub fn peer_of(&self, conn: ConnId) -> Option<ConnId> {
        self.lock().conns.get(&conn).and_then(|e| e.paired_with)
    }

    /// Break a relay pair without dropping either conversation. The peer
    /// is notified; both ends fall back to their checked-in state.
    pub fn unpair(&self, conn: ConnId) {
        let peer_tx = {
            let mut inner = self.lock();
            let peer = match inner.conns.get_mut(&conn) {
                Some(entry) => entry.paired_with.take(),
                None => None,
            };
            match peer {
                Some(peer) => inner.conns.get_mut(&peer).map(|entry| {
                    entry.paired_with = None;
                    entry.relay_tx.clone()
                }),
                None => None,
            }
        };
        if let Some(tx) = peer_tx {
            let _ = tx.try_send(RelayEvent::PeerClosed);
        }
    }

    /// Drop a conversation: its channels, its pairing (the peer is told),
    /// and its entry.
    pub fn unregister(&self, conn: ConnId) {
        let peer_tx = {
            let mut inner = self.lock();
            let entry = inner.conns.remove(&conn);
            inner.channels.retain(|_, c| *c != conn);
            match entry.and_then(|e| e.paired_with) {
                Some(peer) => match inner.conns.get_mut(&peer) {
                    Some(peer_entry) => {
                        peer_entry.paired_with = None;
                        Some(peer_entry.relay_tx.clone())
                    }
                    None => None,
                },
                None => None,
            }
        };
        if let Some(tx) = peer_tx {
            let _ = tx.try_send(RelayEvent::PeerClosed);
        }
    }

    /// Number of live conversations.
    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    /// Whether the registry has no live conversations.
    pub fn is_empty(&self) -> bool {
        self.lock().conns.is_empty()
    }
}
