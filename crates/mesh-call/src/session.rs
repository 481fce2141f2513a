//! Session controller — one call, seen from one participant.
//!
//! Each call runs as a single event loop task that owns the media source, the
//! peer registry, and the negotiator. Lifecycle notifications, inbound
//! signaling, primitive events, and completed negotiation steps all arrive on
//! the same channel, so call state is never shared and never locked.
//!
//! [`CallHandle`] is the cheap, cloneable front door used by transports and the
//! UI layer.

use crate::connection::{ConnectionId, ConnectionState, StepOutcome};
use crate::gateway::{SignalHandler, SignalingGateway, SignalingTransport};
use crate::media::{
    AcquireOutcome, CaptureDevice, LocalMediaSource, LocalStream, MediaStatus, PendingCapture,
};
use crate::negotiator::Negotiator;
use crate::primitive::{PeerConnectionEvent, PeerConnectionFactory, RemoteTrack};
use crate::registry::{PeerRegistry, PeerSnapshot};
use mesh_common::config::MeshConfig;
use mesh_common::event::TransportEvent;
use mesh_common::signal::{IceCandidate, SessionDescription, SignalKind, SignalingMessage};
use mesh_common::{MeshError, MeshResult, PeerId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// How many notices a slow subscriber may fall behind before it lags.
const NOTICE_CAPACITY: usize = 256;

/// Everything the call loop reacts to.
pub(crate) enum CallEvent {
    LocalJoin,
    LocalLeave,
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    OfferRequested(PeerId),
    Signal(SignalingMessage),
    MediaSettled {
        epoch: u64,
        result: MeshResult<LocalStream>,
    },
    MediaLost,
    Primitive {
        peer: PeerId,
        connection: ConnectionId,
        event: PeerConnectionEvent,
    },
    Step {
        peer: PeerId,
        connection: ConnectionId,
        outcome: StepOutcome,
    },
    NegotiationDeadline {
        peer: PeerId,
        connection: ConnectionId,
    },
    Snapshot(oneshot::Sender<CallSnapshot>),
    Shutdown,
}

/// Published to the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallNotice {
    LocalMedia {
        status: MediaStatus,
    },
    ConnectionState {
        peer: PeerId,
        connection: ConnectionId,
        state: ConnectionState,
    },
    /// Attach this track to the tile of `peer`.
    RemoteTrack {
        peer: PeerId,
        track: RemoteTrack,
    },
    /// Negotiation with `peer` failed; the rest of the call is unaffected.
    PeerUnreachable {
        peer: PeerId,
        code: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub local: PeerId,
    pub joined: bool,
    pub media: MediaStatus,
    pub peers: Vec<PeerSnapshot>,
}

/// External capabilities a call runs on.
pub struct CallDeps {
    pub capture: Arc<dyn CaptureDevice>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub transport: Arc<dyn SignalingTransport>,
}

pub struct SessionController {
    local: PeerId,
    joined: bool,
    media: LocalMediaSource,
    registry: PeerRegistry,
    negotiator: Negotiator,
    events: mpsc::UnboundedSender<CallEvent>,
    notices: broadcast::Sender<CallNotice>,
}

impl SessionController {
    pub(crate) fn new(
        local: PeerId,
        config: &MeshConfig,
        deps: CallDeps,
        events: mpsc::UnboundedSender<CallEvent>,
        notices: broadcast::Sender<CallNotice>,
    ) -> Self {
        let negotiator = Negotiator::new(
            deps.factory,
            SignalingGateway::new(local.clone(), deps.transport),
            config.ice.servers(),
            config.call.negotiation_timeout(),
            events.clone(),
            notices.clone(),
        );
        Self {
            local,
            joined: false,
            media: LocalMediaSource::new(deps.capture, config.media.clone()),
            registry: PeerRegistry::new(),
            negotiator,
            events,
            notices,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// The local participant entered the call: start acquiring media.
    /// Negotiations start once acquisition settles, with or without media.
    pub fn on_local_join(&mut self) {
        if self.joined {
            tracing::debug!(local = %self.local, "Already joined");
            return;
        }
        self.joined = true;
        tracing::info!(local = %self.local, "Joined call");

        let Some(PendingCapture { epoch, capture }) = self.media.begin_acquire() else {
            return;
        };
        self.notify_media();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = capture.await;
            let _ = events.send(CallEvent::MediaSettled { epoch, result });
        });
    }

    /// The local participant left: close every connection, forget every peer,
    /// release local media. Safe to call repeatedly.
    pub fn on_local_leave(&mut self) {
        let removed = self.registry.clear();
        for entry in &removed {
            if let Some(connection) = entry.connection() {
                self.negotiator.report_closed(connection);
            }
        }
        let was_acquired = self.media.status() != MediaStatus::Released;
        self.media.release();
        if was_acquired && self.joined {
            self.notify_media();
        }

        if self.joined {
            tracing::info!(local = %self.local, peers = removed.len(), "Left call");
        }
        self.joined = false;
    }

    pub fn on_peer_joined(&mut self, peer: PeerId) {
        if !self.accepts_peer_events(&peer) {
            return;
        }
        match self.registry.add(peer.clone()) {
            Ok(_) => {
                tracing::info!(peer = %peer, "Peer joined");
                self.maybe_initiate(&peer);
            }
            Err(MeshError::AlreadyPresent { .. }) => {
                tracing::debug!(peer = %peer, "Peer announced again");
                if self.media.is_settled() {
                    if let Err(e) = self
                        .negotiator
                        .resume(&mut self.registry, &peer, self.media.stream())
                    {
                        tracing::warn!(peer = %peer, error = %e, "Failed to resume negotiation");
                    }
                }
            }
            Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to register peer"),
        }
    }

    pub fn on_peer_left(&mut self, peer: PeerId) {
        match self.registry.remove(&peer) {
            Some(entry) => {
                if let Some(connection) = entry.connection() {
                    self.negotiator.report_closed(connection);
                }
                tracing::info!(peer = %peer, "Peer left");
            }
            None => tracing::debug!(peer = %peer, "Departure of unknown peer ignored"),
        }
    }

    /// The signaling server asks us to call `peer`, whatever the tie-break says.
    pub fn on_offer_requested(&mut self, peer: PeerId) {
        if !self.accepts_peer_events(&peer) {
            return;
        }
        // The request doubles as a presence announcement.
        let _ = self.registry.add(peer.clone());
        if let Ok(entry) = self.registry.get_mut(&peer) {
            entry.offer_requested = true;
        }
        tracing::info!(peer = %peer, "Offer requested by signaling server");
        self.maybe_initiate(&peer);
    }

    pub(crate) fn on_media_settled(&mut self, epoch: u64, result: MeshResult<LocalStream>) {
        match self.media.finish_acquire(epoch, result) {
            AcquireOutcome::Stale => {
                tracing::debug!(epoch, "Discarding superseded media acquisition");
                return;
            }
            AcquireOutcome::Ready => {}
            AcquireOutcome::Unavailable(e) => {
                tracing::warn!(local = %self.local, error = %e, "Joining without local media");
            }
        }
        self.notify_media();

        for peer in self.registry.peer_ids() {
            let deferred = self.registry.get_mut(&peer).ok().and_then(|entry| {
                let offer = entry.pending_offer.take()?;
                Some((offer, std::mem::take(&mut entry.pending_candidates)))
            });
            match deferred {
                Some((offer, candidates)) => {
                    self.negotiator
                        .handle_offer(&mut self.registry, &peer, offer, self.media.stream());
                    for candidate in candidates {
                        let _ = self
                            .negotiator
                            .handle_remote_candidate(&mut self.registry, &peer, candidate);
                    }
                }
                None => self.maybe_initiate(&peer),
            }
        }
    }

    /// The capture device went away mid-call. Connections stay up.
    pub fn on_media_lost(&mut self) {
        if self.media.lose_device().is_some() {
            self.negotiator.detach_local_media(&mut self.registry);
            self.notify_media();
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            local: self.local.clone(),
            joined: self.joined,
            media: self.media.status(),
            peers: self.registry.snapshot(),
        }
    }

    /// Apply one event. Returns false once the session should stop.
    pub(crate) fn handle(&mut self, event: CallEvent) -> bool {
        match event {
            CallEvent::LocalJoin => self.on_local_join(),
            CallEvent::LocalLeave => self.on_local_leave(),
            CallEvent::PeerJoined(peer) => self.on_peer_joined(peer),
            CallEvent::PeerLeft(peer) => self.on_peer_left(peer),
            CallEvent::OfferRequested(peer) => self.on_offer_requested(peer),
            CallEvent::Signal(message) => {
                let gateway = self.negotiator.gateway().clone();
                gateway.on_receive(message, self);
            }
            CallEvent::MediaSettled { epoch, result } => self.on_media_settled(epoch, result),
            CallEvent::MediaLost => self.on_media_lost(),
            CallEvent::Primitive {
                peer,
                connection,
                event,
            } => self
                .negotiator
                .handle_primitive(&mut self.registry, &peer, connection, event),
            CallEvent::Step {
                peer,
                connection,
                outcome,
            } => self
                .negotiator
                .handle_step(&mut self.registry, &peer, connection, outcome),
            CallEvent::NegotiationDeadline { peer, connection } => self
                .negotiator
                .handle_deadline(&mut self.registry, &peer, connection),
            CallEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            CallEvent::Shutdown => {
                self.on_local_leave();
                return false;
            }
        }
        true
    }

    fn accepts_peer_events(&self, peer: &PeerId) -> bool {
        if !self.joined {
            tracing::debug!(peer = %peer, "Ignoring peer event before local join");
            return false;
        }
        if *peer == self.local {
            return false;
        }
        true
    }

    /// Start negotiating with `peer` if media has settled, nothing is running
    /// yet, and we are the one who should offer.
    fn maybe_initiate(&mut self, peer: &PeerId) {
        if !self.media.is_settled() {
            return;
        }
        let Ok(entry) = self.registry.get(peer) else {
            return;
        };
        if entry.has_active_connection() {
            return;
        }
        if !self.negotiator.is_initiator_for(peer) && !entry.offer_requested {
            tracing::debug!(peer = %peer, "Waiting for the remote side to offer");
            return;
        }
        if let Err(e) = self
            .negotiator
            .initiate(&mut self.registry, peer, self.media.stream())
        {
            tracing::warn!(peer = %peer, error = %e, "Failed to initiate negotiation");
        }
    }

    fn notify_media(&self) {
        let _ = self.notices.send(CallNotice::LocalMedia {
            status: self.media.status(),
        });
    }
}

impl SignalHandler for SessionController {
    fn on_offer(&mut self, from: PeerId, offer: SessionDescription) {
        if !self.joined {
            tracing::debug!(peer = %from, "Dropping offer received before local join");
            return;
        }
        if !self.media.is_settled() {
            match self.registry.get_mut(&from) {
                Ok(entry) => {
                    if entry.pending_offer.as_ref() != Some(&offer) {
                        entry.pending_candidates.clear();
                    }
                    entry.pending_offer = Some(offer);
                    tracing::debug!(peer = %from, "Offer deferred until local media settles");
                }
                Err(e) => tracing::warn!(peer = %from, error = %e, "Dropping offer"),
            }
            return;
        }
        self.negotiator
            .handle_offer(&mut self.registry, &from, offer, self.media.stream());
    }

    fn on_answer(&mut self, from: PeerId, answer: SessionDescription) {
        self.negotiator.handle_answer(&mut self.registry, &from, answer);
    }

    fn on_ice_candidate(&mut self, from: PeerId, candidate: IceCandidate) {
        if let Ok(entry) = self.registry.get_mut(&from) {
            if entry.pending_offer.is_some() {
                entry.pending_candidates.push(candidate);
                return;
            }
        }
        // Orphans are logged by the negotiator.
        let _ = self
            .negotiator
            .handle_remote_candidate(&mut self.registry, &from, candidate);
    }

    fn on_malformed(&mut self, from: PeerId, kind: &SignalKind, error: MeshError) {
        match kind {
            SignalKind::Offer | SignalKind::Answer => {
                self.negotiator
                    .reject_description(&mut self.registry, &from, error);
            }
            _ => {
                tracing::warn!(
                    peer = %from,
                    kind = %kind,
                    error = %error,
                    "Dropping malformed signaling message"
                );
            }
        }
    }
}

/// Drive one call until it is shut down.
async fn run_call(mut controller: SessionController, mut events: mpsc::UnboundedReceiver<CallEvent>) {
    tracing::info!(local = %controller.local(), "Call session started");
    while let Some(event) = events.recv().await {
        if !controller.handle(event) {
            break;
        }
    }
    controller.on_local_leave();
    tracing::info!(local = %controller.local(), "Call session stopped");
}

/// Handle to a running call session.
#[derive(Clone)]
pub struct CallHandle {
    local: PeerId,
    events: mpsc::UnboundedSender<CallEvent>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallHandle {
    /// Spawn the session loop for participant `local`. The session starts
    /// outside the call; call [`CallHandle::join`] to enter it.
    pub fn spawn(local: PeerId, config: &MeshConfig, deps: CallDeps) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let controller = SessionController::new(
            local.clone(),
            config,
            deps,
            events_tx.clone(),
            notices.clone(),
        );
        tokio::spawn(run_call(controller, events_rx));

        Self {
            local,
            events: events_tx,
            notices,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    fn send(&self, event: CallEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn join(&self) -> bool {
        self.send(CallEvent::LocalJoin)
    }

    pub fn leave(&self) -> bool {
        self.send(CallEvent::LocalLeave)
    }

    pub fn peer_joined(&self, peer: PeerId) -> bool {
        self.send(CallEvent::PeerJoined(peer))
    }

    pub fn peer_left(&self, peer: PeerId) -> bool {
        self.send(CallEvent::PeerLeft(peer))
    }

    pub fn offer_requested(&self, peer: PeerId) -> bool {
        self.send(CallEvent::OfferRequested(peer))
    }

    /// Hand an inbound signaling message to the session.
    pub fn deliver(&self, message: SignalingMessage) -> bool {
        self.send(CallEvent::Signal(message))
    }

    pub fn media_lost(&self) -> bool {
        self.send(CallEvent::MediaLost)
    }

    /// Route a transport event to the matching lifecycle callback.
    pub fn apply(&self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::PeerJoined { peer_id } => self.peer_joined(peer_id),
            TransportEvent::PeerLeft { peer_id } => self.peer_left(peer_id),
            TransportEvent::OfferRequested { peer_id } => self.offer_requested(peer_id),
            TransportEvent::Signal(message) => self.deliver(message),
        }
    }

    /// Feed every event from a transport subscription into the session.
    pub fn forward(&self, mut transport: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(event) = transport.recv().await {
                if !handle.apply(event) {
                    break;
                }
            }
            tracing::debug!(local = %handle.local, "Transport subscription ended");
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub async fn snapshot(&self) -> MeshResult<CallSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(CallEvent::Snapshot(tx)) {
            return Err(MeshError::Internal(anyhow::anyhow!("call session has shut down")));
        }
        rx.await
            .map_err(|_| MeshError::Internal(anyhow::anyhow!("call session has shut down")))
    }

    /// Leave the call and stop the session loop.
    pub fn shutdown(&self) {
        let _ = self.send(CallEvent::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDevice, LoopbackNetwork};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<SignalingMessage>>,
    }

    impl SignalingTransport for Outbox {
        fn send(&self, message: SignalingMessage) -> MeshResult<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn controller(
        local: &str,
        device: Arc<LoopbackDevice>,
    ) -> (SessionController, mpsc::UnboundedReceiver<CallEvent>) {
        let network = LoopbackNetwork::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let deps = CallDeps {
            capture: device,
            factory: network.factory(PeerId::from(local)),
            transport: Arc::new(Outbox::default()),
        };
        let controller = SessionController::new(
            PeerId::from(local),
            &MeshConfig::default(),
            deps,
            events_tx,
            notices,
        );
        (controller, events_rx)
    }

    /// Feed media completion back like the loop would.
    async fn settle(
        controller: &mut SessionController,
        events: &mut mpsc::UnboundedReceiver<CallEvent>,
    ) {
        loop {
            match events.recv().await {
                Some(CallEvent::MediaSettled { epoch, result }) => {
                    controller.on_media_settled(epoch, result);
                    return;
                }
                Some(other) => {
                    controller.handle(other);
                }
                None => return,
            }
        }
    }

    #[tokio::test]
    async fn peer_events_before_join_are_ignored() {
        let (mut controller, _events) = controller("alice", LoopbackDevice::new());
        controller.on_peer_joined(PeerId::from("bob"));
        assert!(controller.snapshot().peers.is_empty());
    }

    #[tokio::test]
    async fn repeated_join_and_leave_do_not_leak() {
        let device = LoopbackDevice::new();
        let (mut controller, mut events) = controller("alice", device.clone());

        controller.on_local_join();
        controller.on_local_join();
        settle(&mut controller, &mut events).await;
        controller.on_peer_joined(PeerId::from("bob"));
        controller.on_peer_joined(PeerId::from("bob"));
        assert_eq!(controller.snapshot().peers.len(), 1);
        assert_eq!(device.active_streams(), 1);

        controller.on_local_leave();
        controller.on_local_leave();
        let snapshot = controller.snapshot();
        assert!(snapshot.peers.is_empty());
        assert_eq!(snapshot.media, MediaStatus::Released);
        assert_eq!(device.active_streams(), 0);
    }

    #[tokio::test]
    async fn initiator_waits_for_media_before_offering() {
        let (mut controller, mut events) = controller("alice", LoopbackDevice::new());
        controller.on_local_join();
        controller.on_peer_joined(PeerId::from("bob"));

        assert!(controller.snapshot().peers[0].connection.is_none());

        settle(&mut controller, &mut events).await;
        let snapshot = controller.snapshot();
        let connection = snapshot.peers[0].connection.as_ref().expect("offer starts once media settles");
        assert_eq!(connection.state, ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn non_initiator_waits_for_an_offer() {
        let (mut controller, mut events) = controller("bob", LoopbackDevice::new());
        controller.on_local_join();
        settle(&mut controller, &mut events).await;
        controller.on_peer_joined(PeerId::from("alice"));

        assert!(controller.snapshot().peers[0].connection.is_none());

        controller.on_offer_requested(PeerId::from("alice"));
        assert!(controller.snapshot().peers[0].connection.is_some());
    }

    #[tokio::test]
    async fn offer_before_media_is_answered_after_it_settles() {
        let device = LoopbackDevice::slow(Duration::from_millis(20));
        let (mut controller, mut events) = controller("bob", device);
        controller.on_local_join();
        controller.on_peer_joined(PeerId::from("alice"));

        controller.on_offer(PeerId::from("alice"), SessionDescription::offer("v=0\r\ns=alice\r\n"));
        controller.on_ice_candidate(PeerId::from("alice"), IceCandidate::new("candidate:0"));
        let snapshot = controller.snapshot();
        assert!(snapshot.peers[0].pending_offer);
        assert!(snapshot.peers[0].connection.is_none());

        settle(&mut controller, &mut events).await;
        let snapshot = controller.snapshot();
        assert!(!snapshot.peers[0].pending_offer);
        let connection = snapshot.peers[0].connection.as_ref().unwrap();
        assert_eq!(connection.role, crate::connection::Role::Answerer);
    }

    #[tokio::test]
    async fn undecodable_answer_fails_the_connection() {
        let (mut controller, mut events) = controller("alice", LoopbackDevice::new());
        let mut notices = controller.notices.subscribe();
        controller.on_local_join();
        settle(&mut controller, &mut events).await;
        controller.on_peer_joined(PeerId::from("bob"));
        assert!(controller.snapshot().peers[0].connection.is_some());

        controller.handle(CallEvent::Signal(SignalingMessage {
            to_peer: PeerId::from("alice"),
            from_peer: PeerId::from("bob"),
            kind: SignalKind::Answer,
            payload: serde_json::json!("garbage"),
        }));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.peers.len(), 1, "bob is still in the call");
        assert!(snapshot.peers[0].connection.is_none());
        let unreachable = std::iter::from_fn(|| notices.try_recv().ok()).any(|n| {
            matches!(n, CallNotice::PeerUnreachable { ref code, .. } if code == "NEGOTIATION_FAILED")
        });
        assert!(unreachable);
    }

    #[tokio::test]
    async fn undecodable_candidate_is_only_dropped() {
        let (mut controller, mut events) = controller("alice", LoopbackDevice::new());
        controller.on_local_join();
        settle(&mut controller, &mut events).await;
        controller.on_peer_joined(PeerId::from("bob"));

        controller.handle(CallEvent::Signal(SignalingMessage {
            to_peer: PeerId::from("alice"),
            from_peer: PeerId::from("bob"),
            kind: SignalKind::IceCandidate,
            payload: serde_json::json!(42),
        }));

        assert!(controller.snapshot().peers[0].connection.is_some());
    }

    #[tokio::test]
    async fn denied_media_still_negotiates() {
        let (mut controller, mut events) = controller("alice", LoopbackDevice::denied());
        controller.on_local_join();
        settle(&mut controller, &mut events).await;
        assert_eq!(controller.snapshot().media, MediaStatus::Unavailable);

        controller.on_peer_joined(PeerId::from("bob"));
        assert!(controller.snapshot().peers[0].connection.is_some());
    }
}
