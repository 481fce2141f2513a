//! In-process signaling bus.
//!
//! Plays the role of the signaling server for participants living in the same
//! process: announces joins and departures to every member and relays
//! signaling messages to exactly one recipient. Delivery is ordered per
//! sender; the bus can be switched to at-least-once mode where every message
//! is delivered twice.

use mesh_call::SignalingTransport;
use mesh_common::event::TransportEvent;
use mesh_common::signal::SignalingMessage;
use mesh_common::{MeshError, MeshResult, PeerId};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct BusState {
    members: BTreeMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    /// Members whose outbound sends currently fail.
    down: HashSet<PeerId>,
    /// Members whose outbound sends are accepted and then lost.
    lossy: HashSet<PeerId>,
    relayed: u64,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    duplicate: bool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that delivers every signaling message twice.
    pub fn with_duplicates() -> Self {
        Self {
            duplicate: true,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `peer` to the call. Existing members learn about it, and it learns
    /// about every existing member. Joining again replaces the subscription.
    pub fn join(&self, peer: PeerId) -> (Arc<BusEndpoint>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();

        for (member, member_tx) in &state.members {
            if *member == peer {
                continue;
            }
            let _ = member_tx.send(TransportEvent::PeerJoined {
                peer_id: peer.clone(),
            });
            let _ = tx.send(TransportEvent::PeerJoined {
                peer_id: member.clone(),
            });
        }
        state.members.insert(peer.clone(), tx);
        tracing::debug!(peer = %peer, members = state.members.len(), "Joined signaling bus");

        let endpoint = Arc::new(BusEndpoint {
            bus: self.clone(),
            local: peer,
        });
        (endpoint, rx)
    }

    /// Remove `peer`; every remaining member is told it left.
    pub fn leave(&self, peer: &PeerId) {
        let mut state = self.state();
        if state.members.remove(peer).is_none() {
            return;
        }
        for member_tx in state.members.values() {
            let _ = member_tx.send(TransportEvent::PeerLeft {
                peer_id: peer.clone(),
            });
        }
        tracing::debug!(peer = %peer, members = state.members.len(), "Left signaling bus");
    }

    /// Announce `peer` to the members again, as a server does after a
    /// reconnect.
    pub fn reannounce(&self, peer: &PeerId) {
        let state = self.state();
        for (member, member_tx) in &state.members {
            if member != peer {
                let _ = member_tx.send(TransportEvent::PeerJoined {
                    peer_id: peer.clone(),
                });
            }
        }
    }

    /// Ask `target` to call `peer`.
    pub fn request_offer(&self, target: &PeerId, peer: &PeerId) -> MeshResult<()> {
        let state = self.state();
        let tx = state
            .members
            .get(target)
            .ok_or_else(|| MeshError::Transport(format!("{target} is not on the bus")))?;
        tx.send(TransportEvent::OfferRequested {
            peer_id: peer.clone(),
        })
        .map_err(|_| MeshError::Transport(format!("{target} stopped listening")))
    }

    /// Make every send from `peer` fail until brought back up.
    pub fn set_down(&self, peer: &PeerId, down: bool) {
        let mut state = self.state();
        if down {
            state.down.insert(peer.clone());
        } else {
            state.down.remove(peer);
        }
    }

    /// Accept every send from `peer` but deliver none of them, like a socket
    /// that dies after the write was queued.
    pub fn set_lossy(&self, peer: &PeerId, lossy: bool) {
        let mut state = self.state();
        if lossy {
            state.lossy.insert(peer.clone());
        } else {
            state.lossy.remove(peer);
        }
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.state().members.keys().cloned().collect()
    }

    /// Signaling messages relayed so far (duplicates counted once).
    pub fn relayed(&self) -> u64 {
        self.state().relayed
    }

    fn relay(&self, from: &PeerId, message: SignalingMessage) -> MeshResult<()> {
        let mut state = self.state();
        if state.down.contains(from) {
            return Err(MeshError::Transport(format!("{from} is offline")));
        }
        if !state.members.contains_key(from) {
            return Err(MeshError::Transport(format!("{from} is not on the bus")));
        }
        if state.lossy.contains(from) {
            tracing::debug!(from = %from, kind = %message.kind, "Signaling message lost");
            return Ok(());
        }
        let to = message.to_peer.clone();
        let tx = state.members.get(&to).ok_or_else(|| MeshError::SignalingSendFailure {
            peer: to.clone(),
            reason: "recipient is not on the bus".into(),
        })?;

        let copies = if self.duplicate { 2 } else { 1 };
        for _ in 0..copies {
            tx.send(TransportEvent::Signal(message.clone()))
                .map_err(|_| MeshError::SignalingSendFailure {
                    peer: to.clone(),
                    reason: "recipient stopped listening".into(),
                })?;
        }
        state.relayed += 1;
        Ok(())
    }
}

/// One member's outbound side of the bus.
pub struct BusEndpoint {
    bus: MemoryBus,
    local: PeerId,
}

impl BusEndpoint {
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

impl SignalingTransport for BusEndpoint {
    fn send(&self, message: SignalingMessage) -> MeshResult<()> {
        if message.from_peer != self.local {
            return Err(MeshError::Transport(format!(
                "{} cannot send on behalf of {}",
                self.local, message.from_peer
            )));
        }
        self.bus.relay(&self.local, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_common::signal::SessionDescription;

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    #[tokio::test]
    async fn join_announces_both_directions() {
        let bus = MemoryBus::new();
        let (_a, mut a_rx) = bus.join(id("alice"));
        let (_b, mut b_rx) = bus.join(id("bob"));

        assert_eq!(
            a_rx.recv().await.unwrap(),
            TransportEvent::PeerJoined { peer_id: id("bob") }
        );
        assert_eq!(
            b_rx.recv().await.unwrap(),
            TransportEvent::PeerJoined { peer_id: id("alice") }
        );

        bus.leave(&id("bob"));
        assert_eq!(
            a_rx.recv().await.unwrap(),
            TransportEvent::PeerLeft { peer_id: id("bob") }
        );
        assert_eq!(bus.members(), vec![id("alice")]);
    }

    #[tokio::test]
    async fn messages_reach_only_their_recipient() {
        let bus = MemoryBus::new();
        let (alice, _a_rx) = bus.join(id("alice"));
        let (_b, mut b_rx) = bus.join(id("bob"));
        let (_c, mut c_rx) = bus.join(id("carol"));
        // Drain join announcements.
        while b_rx.try_recv().is_ok() {}
        while c_rx.try_recv().is_ok() {}

        let offer =
            SignalingMessage::offer(&id("alice"), &id("bob"), &SessionDescription::offer("v=0"))
                .unwrap();
        alice.send(offer.clone()).unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), TransportEvent::Signal(offer));
        assert!(c_rx.try_recv().is_err());
        assert_eq!(bus.relayed(), 1);
    }

    #[tokio::test]
    async fn duplicate_mode_delivers_twice() {
        let bus = MemoryBus::with_duplicates();
        let (alice, _a_rx) = bus.join(id("alice"));
        let (_b, mut b_rx) = bus.join(id("bob"));
        b_rx.recv().await.unwrap();

        let offer =
            SignalingMessage::offer(&id("alice"), &id("bob"), &SessionDescription::offer("v=0"))
                .unwrap();
        alice.send(offer.clone()).unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), TransportEvent::Signal(offer.clone()));
        assert_eq!(b_rx.recv().await.unwrap(), TransportEvent::Signal(offer));
    }

    #[tokio::test]
    async fn sends_fail_while_down_or_unaddressable() {
        let bus = MemoryBus::new();
        let (alice, _a_rx) = bus.join(id("alice"));
        let offer =
            SignalingMessage::offer(&id("alice"), &id("bob"), &SessionDescription::offer("v=0"))
                .unwrap();
        assert!(matches!(
            alice.send(offer.clone()),
            Err(MeshError::SignalingSendFailure { .. })
        ));

        let (_b, _b_rx) = bus.join(id("bob"));
        bus.set_down(&id("alice"), true);
        assert!(alice.send(offer.clone()).is_err());
        bus.set_down(&id("alice"), false);
        assert!(alice.send(offer).is_ok());
    }

    #[tokio::test]
    async fn lossy_member_sends_succeed_but_never_arrive() {
        let bus = MemoryBus::new();
        let (alice, _a_rx) = bus.join(id("alice"));
        let (_b, mut b_rx) = bus.join(id("bob"));
        b_rx.recv().await.unwrap();

        let offer =
            SignalingMessage::offer(&id("alice"), &id("bob"), &SessionDescription::offer("v=0"))
                .unwrap();
        bus.set_lossy(&id("alice"), true);
        assert!(alice.send(offer.clone()).is_ok());
        assert!(b_rx.try_recv().is_err());
        assert_eq!(bus.relayed(), 0);

        bus.set_lossy(&id("alice"), false);
        alice.send(offer.clone()).unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), TransportEvent::Signal(offer));
    }
}
