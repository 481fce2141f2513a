//! Peer registry — the remote participants of one call and their connections.
//!
//! Owned by a single call session; there is no process-wide peer map.

use crate::connection::{Connection, ConnectionSnapshot};
use chrono::{DateTime, Utc};
use mesh_common::signal::{IceCandidate, SessionDescription};
use mesh_common::{MeshError, MeshResult, PeerId};
use serde::Serialize;
use std::collections::HashMap;

/// One remote participant.
pub struct PeerEntry {
    pub peer_id: PeerId,
    connection: Option<Connection>,
    /// Offer received before local media settled, answered once it does.
    pub(crate) pending_offer: Option<SessionDescription>,
    /// Candidates that arrived after `pending_offer`.
    pub(crate) pending_candidates: Vec<IceCandidate>,
    /// The signaling server asked us to call this peer.
    pub(crate) offer_requested: bool,
    pub joined_at: DateTime<Utc>,
}

impl PeerEntry {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            connection: None,
            pending_offer: None,
            pending_candidates: Vec::new(),
            offer_requested: false,
            joined_at: Utc::now(),
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    /// Whether a connection is negotiating or past it.
    pub fn has_active_connection(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.state().is_active() && !c.is_closing())
    }

    /// Install a connection. The previous one, if any, is handed back so the
    /// caller can close and report it.
    pub(crate) fn replace_connection(&mut self, connection: Connection) -> Option<Connection> {
        self.connection.replace(connection)
    }

    pub(crate) fn take_connection(&mut self) -> Option<Connection> {
        self.connection.take()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            connection: self.connection.as_ref().map(Connection::snapshot),
            pending_offer: self.pending_offer.is_some(),
            joined_at: self.joined_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub connection: Option<ConnectionSnapshot>,
    pub pending_offer: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. Fails with `AlreadyPresent` if it is known;
    /// callers treat that as a no-op.
    pub fn add(&mut self, peer_id: PeerId) -> MeshResult<&mut PeerEntry> {
        if self.peers.contains_key(&peer_id) {
            return Err(MeshError::AlreadyPresent { peer: peer_id });
        }
        tracing::debug!(peer = %peer_id, "Peer registered");
        Ok(self
            .peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerEntry::new(peer_id)))
    }

    /// Unregister a participant, closing its connection first. No-op if the
    /// peer is unknown.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerEntry> {
        let mut entry = self.peers.remove(peer_id)?;
        if let Some(connection) = entry.connection.as_mut() {
            connection.close();
        }
        tracing::debug!(peer = %peer_id, "Peer unregistered");
        Some(entry)
    }

    pub fn get(&self, peer_id: &PeerId) -> MeshResult<&PeerEntry> {
        self.peers.get(peer_id).ok_or_else(|| MeshError::NotFound {
            peer: peer_id.clone(),
        })
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> MeshResult<&mut PeerEntry> {
        self.peers.get_mut(peer_id).ok_or_else(|| MeshError::NotFound {
            peer: peer_id.clone(),
        })
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Known peer ids, sorted.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut PeerEntry> {
        self.peers.values_mut()
    }

    /// Remove every participant, closing all connections.
    pub fn clear(&mut self) -> Vec<PeerEntry> {
        let ids = self.peer_ids();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self.peers.values().map(PeerEntry::snapshot).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_twice_reports_already_present() {
        let mut registry = PeerRegistry::new();
        registry.add(PeerId::from("bob")).unwrap();

        let err = registry.add(PeerId::from("bob")).err().unwrap();
        assert!(matches!(err, MeshError::AlreadyPresent { .. }));
        assert!(err.is_benign());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = PeerRegistry::new();
        registry.add(PeerId::from("bob")).unwrap();
        registry.add(PeerId::from("carol")).unwrap();

        assert!(registry.remove(&PeerId::from("bob")).is_some());
        assert!(registry.remove(&PeerId::from("bob")).is_none());

        assert_eq!(registry.peer_ids(), vec![PeerId::from("carol")]);
        assert!(matches!(
            registry.get(&PeerId::from("bob")),
            Err(MeshError::NotFound { .. })
        ));
    }

    #[test]
    fn clear_empties_the_registry() {
        let mut registry = PeerRegistry::new();
        for id in ["bob", "carol", "dave"] {
            registry.add(PeerId::from(id)).unwrap();
        }
        assert_eq!(registry.clear().len(), 3);
        assert!(registry.is_empty());
    }
}
