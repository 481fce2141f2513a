//! Connection negotiator — drives offer/answer/candidate exchange for every
//! remote peer.
//!
//! All methods run on the call loop and never await. Work on the primitive is
//! submitted to the connection's worker and comes back later as a step
//! outcome, at which point the target connection is looked up again by id:
//! a peer that left, or a connection that was replaced, turns the outcome
//! into a no-op.
//!
//! Glare is resolved with the initiator tie-break ([`PeerId::initiates_to`]):
//! the designated initiator ignores a competing offer, the other side drops
//! its own offer and answers.

use crate::connection::{Connection, ConnectionId, ConnectionState, Op, Role, StepOutcome};
use crate::gateway::SignalingGateway;
use crate::media::LocalStream;
use crate::primitive::{PeerConnectionEvent, PeerConnectionFactory, PeerEvents, TransportState};
use crate::registry::{PeerEntry, PeerRegistry};
use crate::session::{CallEvent, CallNotice};
use mesh_common::signal::{IceCandidate, IceServer, SessionDescription};
use mesh_common::{MeshError, MeshResult, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub struct Negotiator {
    local: PeerId,
    factory: Arc<dyn PeerConnectionFactory>,
    gateway: SignalingGateway,
    ice_servers: Vec<IceServer>,
    negotiation_timeout: Duration,
    events: mpsc::UnboundedSender<CallEvent>,
    notices: broadcast::Sender<CallNotice>,
    next_connection: u64,
}

impl Negotiator {
    pub(crate) fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        gateway: SignalingGateway,
        ice_servers: Vec<IceServer>,
        negotiation_timeout: Duration,
        events: mpsc::UnboundedSender<CallEvent>,
        notices: broadcast::Sender<CallNotice>,
    ) -> Self {
        Self {
            local: gateway.local().clone(),
            factory,
            gateway,
            ice_servers,
            negotiation_timeout,
            events,
            notices,
            next_connection: 0,
        }
    }

    pub fn gateway(&self) -> &SignalingGateway {
        &self.gateway
    }

    /// Whether we are the designated offerer towards `remote`.
    pub fn is_initiator_for(&self, remote: &PeerId) -> bool {
        self.local.initiates_to(remote)
    }

    /// Offerer path: create a connection to `peer`, attach local tracks and
    /// start generating an offer. No-op if an active connection exists.
    pub fn initiate(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        stream: Option<&LocalStream>,
    ) -> MeshResult<ConnectionId> {
        let entry = registry.get_mut(peer)?;
        entry.offer_requested = false;
        if entry.has_active_connection() {
            if let Some(existing) = entry.connection() {
                return Ok(existing.id());
            }
        }

        let mut connection = match self.open(peer, Role::Offerer, stream) {
            Ok(connection) => connection,
            Err(e) => {
                self.report_unreachable(peer, &e);
                return Err(e);
            }
        };
        connection.submit(Op::CreateOffer);
        self.set_state(&mut connection, ConnectionState::Negotiating);
        let id = connection.id();
        if let Some(previous) = entry.replace_connection(connection) {
            self.retire(previous);
        }

        tracing::info!(peer = %peer, connection = %id, "Initiating negotiation");
        Ok(id)
    }

    /// Answerer path, including glare resolution and duplicate suppression.
    pub fn handle_offer(
        &mut self,
        registry: &mut PeerRegistry,
        from: &PeerId,
        offer: SessionDescription,
        stream: Option<&LocalStream>,
    ) {
        let Ok(entry) = registry.get_mut(from) else {
            tracing::warn!(peer = %from, "Dropping offer from unknown peer");
            return;
        };

        if let Some(existing) = entry.connection_mut().filter(|c| !c.is_closing()) {
            match existing.role() {
                Role::Answerer if existing.remote_description() == Some(&offer) => {
                    // The offerer repeats itself when our answer went missing.
                    tracing::debug!(peer = %from, "Duplicate offer, no new connection");
                    self.resend(existing);
                    return;
                }
                Role::Offerer if self.is_initiator_for(from) => {
                    tracing::info!(
                        peer = %from,
                        connection = %existing.id(),
                        "Glare: keeping our offer, ignoring the inbound one"
                    );
                    return;
                }
                role => {
                    tracing::info!(
                        peer = %from,
                        connection = %existing.id(),
                        role = ?role,
                        "Dropping current connection to answer inbound offer"
                    );
                }
            }
        }

        let mut connection = match self.open(from, Role::Answerer, stream) {
            Ok(connection) => connection,
            Err(e) => {
                if let Some(previous) = entry.take_connection() {
                    self.retire(previous);
                }
                self.report_unreachable(from, &e);
                return;
            }
        };
        connection.set_remote_description(offer.clone());
        connection.submit(Op::AcceptOffer(offer));
        self.set_state(&mut connection, ConnectionState::Negotiating);
        let id = connection.id();
        if let Some(previous) = entry.replace_connection(connection) {
            self.retire(previous);
        }

        tracing::info!(peer = %from, connection = %id, "Answering offer");
    }

    pub fn handle_answer(
        &mut self,
        registry: &mut PeerRegistry,
        from: &PeerId,
        answer: SessionDescription,
    ) {
        let Some(connection) = registry
            .get_mut(from)
            .ok()
            .and_then(PeerEntry::connection_mut)
            .filter(|c| !c.is_closing())
        else {
            tracing::warn!(peer = %from, "Dropping answer without a connection");
            return;
        };

        if connection.role() != Role::Offerer {
            tracing::warn!(peer = %from, "Dropping answer for a connection we did not offer on");
            return;
        }
        match connection.remote_description() {
            Some(applied) if *applied == answer => {
                tracing::debug!(peer = %from, "Duplicate answer ignored");
                return;
            }
            Some(_) => {
                tracing::warn!(peer = %from, "Conflicting answer ignored");
                return;
            }
            None => {}
        }
        if connection.local_description().is_none() {
            tracing::warn!(peer = %from, "Dropping answer that arrived before our offer");
            return;
        }

        connection.set_remote_description(answer.clone());
        connection.submit(Op::AcceptAnswer(answer));
    }

    /// Apply an inbound candidate. Without a connection it is an orphan and
    /// gets dropped.
    pub fn handle_remote_candidate(
        &mut self,
        registry: &mut PeerRegistry,
        from: &PeerId,
        candidate: IceCandidate,
    ) -> MeshResult<()> {
        let connection = registry
            .get_mut(from)
            .ok()
            .and_then(PeerEntry::connection_mut)
            .filter(|c| !c.is_closing());

        match connection {
            Some(connection) => {
                connection.submit(Op::AddRemoteCandidate(candidate));
                Ok(())
            }
            None => {
                let e = MeshError::OrphanCandidate { peer: from.clone() };
                tracing::warn!(peer = %from, error = %e, "Dropping ICE candidate");
                Err(e)
            }
        }
    }

    /// A worker step finished.
    pub(crate) fn handle_step(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        id: ConnectionId,
        outcome: StepOutcome,
    ) {
        let Ok(entry) = registry.get_mut(peer) else {
            tracing::debug!(peer = %peer, connection = %id, "Step for departed peer discarded");
            return;
        };
        let Some(connection) = current(entry, id) else {
            tracing::debug!(peer = %peer, connection = %id, "Stale step discarded");
            return;
        };

        match outcome {
            StepOutcome::LocalOffer(desc) | StepOutcome::LocalAnswer(desc) => {
                connection.set_local_description(desc);
                self.flush(connection);
            }
            StepOutcome::RemoteAnswerApplied => {
                tracing::debug!(peer = %peer, connection = %id, "Remote answer applied");
                self.flush(connection);
            }
            StepOutcome::CandidateApplied => {
                tracing::trace!(peer = %peer, connection = %id, "Remote candidate applied");
            }
            StepOutcome::CandidateRejected(e) => {
                tracing::warn!(peer = %peer, connection = %id, error = %e, "Remote candidate rejected");
            }
            StepOutcome::Failed(e) => {
                let e = negotiation_error(peer, e);
                self.fail(entry, e);
            }
        }
    }

    /// An event reported by a connection's primitive.
    pub(crate) fn handle_primitive(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        id: ConnectionId,
        event: PeerConnectionEvent,
    ) {
        let Ok(entry) = registry.get_mut(peer) else {
            return;
        };
        let Some(connection) = current(entry, id) else {
            tracing::trace!(peer = %peer, connection = %id, "Event from retired connection ignored");
            return;
        };

        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                connection.queue_candidate(candidate);
            }
            PeerConnectionEvent::Track(track) => {
                if connection.add_remote_track(track.clone()) {
                    tracing::info!(peer = %peer, track = %track.id, kind = ?track.kind, "Remote track received");
                    let _ = self.notices.send(CallNotice::RemoteTrack {
                        peer: peer.clone(),
                        track,
                    });
                }
                self.refresh(connection);
            }
            PeerConnectionEvent::StateChange(state) => match state {
                TransportState::Connected => {
                    connection.set_transport_connected(true);
                    self.refresh(connection);
                }
                TransportState::Disconnected => {
                    connection.set_transport_connected(false);
                    if self.set_state(connection, ConnectionState::Disconnected) {
                        tracing::warn!(peer = %peer, connection = %id, "Connectivity lost, waiting for recovery");
                    }
                }
                TransportState::Failed => {
                    let e = MeshError::NegotiationFailed {
                        peer: peer.clone(),
                        reason: "ICE connectivity failed".into(),
                    };
                    self.fail(entry, e);
                    return;
                }
                TransportState::Closed => {
                    let e = MeshError::NegotiationFailed {
                        peer: peer.clone(),
                        reason: "peer connection closed underneath us".into(),
                    };
                    self.fail(entry, e);
                    return;
                }
                TransportState::New | TransportState::Connecting => {}
            },
            PeerConnectionEvent::NegotiationNeeded => {
                if connection.role() == Role::Offerer
                    && connection.local_description().is_none()
                    && !connection.offer_in_flight()
                {
                    connection.submit(Op::CreateOffer);
                } else {
                    tracing::debug!(peer = %peer, connection = %id, "Negotiation-needed ignored");
                }
            }
        }

        // Any event is a chance to retry what failed to send earlier.
        self.flush(connection);
    }

    /// The negotiation deadline of a connection elapsed.
    pub(crate) fn handle_deadline(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        id: ConnectionId,
    ) {
        let Ok(entry) = registry.get_mut(peer) else {
            return;
        };
        let Some(connection) = current(entry, id) else {
            return;
        };
        if connection.state() == ConnectionState::Negotiating && !connection.transport_connected() {
            let e = MeshError::NegotiationTimeout {
                peer: peer.clone(),
                timeout_ms: u64::try_from(self.negotiation_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            };
            self.fail(entry, e);
        }
    }

    /// A known peer was announced again: re-send the local description if the
    /// remote never acknowledged it, or start over if its connection failed
    /// and we are the offerer.
    pub fn resume(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        stream: Option<&LocalStream>,
    ) -> MeshResult<()> {
        let entry = registry.get_mut(peer)?;
        if let Some(connection) = entry.connection_mut().filter(|c| !c.is_closing()) {
            self.resend(connection);
            return Ok(());
        }
        if self.is_initiator_for(peer) || entry.offer_requested {
            self.initiate(registry, peer, stream)?;
        }
        Ok(())
    }

    /// A description from `from` could not be decoded. Fatal errors end the
    /// live connection to that peer; without one there is nothing to fail.
    pub fn reject_description(
        &mut self,
        registry: &mut PeerRegistry,
        from: &PeerId,
        error: MeshError,
    ) {
        let Ok(entry) = registry.get_mut(from) else {
            tracing::warn!(peer = %from, error = %error, "Dropping malformed description");
            return;
        };
        if !error.is_fatal_for_connection()
            || entry.connection().filter(|c| !c.is_closing()).is_none()
        {
            tracing::warn!(peer = %from, error = %error, "Dropping malformed description");
            return;
        }
        self.fail(entry, negotiation_error(from, error));
    }

    /// Stop sending local media on every connection.
    pub fn detach_local_media(&mut self, registry: &mut PeerRegistry) {
        for entry in registry.entries_mut() {
            if let Some(connection) = entry.connection_mut() {
                connection.detach_tracks();
            }
        }
    }

    /// Report a connection closed by someone else (registry removal).
    pub(crate) fn report_closed(&self, connection: &Connection) {
        let _ = self.notices.send(CallNotice::ConnectionState {
            peer: connection.remote_peer().clone(),
            connection: connection.id(),
            state: ConnectionState::Closed,
        });
    }

    fn open(
        &mut self,
        peer: &PeerId,
        role: Role,
        stream: Option<&LocalStream>,
    ) -> MeshResult<Connection> {
        self.next_connection += 1;
        let id = ConnectionId::new(self.next_connection);
        let events = PeerEvents::new(peer.clone(), id, self.events.clone());
        let pc = self
            .factory
            .create(peer, &self.ice_servers, events)
            .map_err(|e| negotiation_error(peer, e))?;

        let mut connection = Connection::open(
            id,
            peer.clone(),
            role,
            pc,
            self.events.clone(),
            self.negotiation_timeout,
        );
        if let Some(stream) = stream {
            connection.attach_tracks(stream);
        }
        Ok(connection)
    }

    /// Repeat the local description and the candidates sent after it while the
    /// remote has not acknowledged them; otherwise just flush what is queued.
    fn resend(&self, connection: &mut Connection) {
        if connection.unacknowledged() && connection.description_sent() {
            tracing::debug!(
                peer = %connection.remote_peer(),
                connection = %connection.id(),
                "Re-sending unacknowledged local description"
            );
            connection.rewind();
        }
        self.flush(connection);
    }

    /// Hand the local description, then every queued candidate, to the gateway.
    /// Stops at the first send failure; the rest stays queued for a retry.
    fn flush(&self, connection: &mut Connection) {
        if connection.is_closing() {
            return;
        }

        if !connection.description_sent() {
            let Some(desc) = connection.local_description() else {
                // Candidates are useless to the remote before our description.
                return;
            };
            let peer = connection.remote_peer();
            let sent = match connection.role() {
                Role::Offerer => self.gateway.send_offer(peer, desc),
                Role::Answerer => self.gateway.send_answer(peer, desc),
            };
            if sent.is_err() {
                return;
            }
            connection.mark_description_sent();
            tracing::debug!(
                peer = %connection.remote_peer(),
                connection = %connection.id(),
                role = ?connection.role(),
                "Local description sent"
            );
        }

        while let Some(candidate) = connection.front_candidate() {
            if self
                .gateway
                .send_ice_candidate(connection.remote_peer(), candidate)
                .is_err()
            {
                break;
            }
            connection.pop_candidate();
        }
    }

    fn refresh(&self, connection: &mut Connection) {
        if let Some(target) = connection.connectivity_target() {
            if self.set_state(connection, target) {
                tracing::info!(
                    peer = %connection.remote_peer(),
                    connection = %connection.id(),
                    "Media connection established"
                );
            }
        }
    }

    fn set_state(&self, connection: &mut Connection, next: ConnectionState) -> bool {
        if !connection.transition(next) {
            return false;
        }
        let _ = self.notices.send(CallNotice::ConnectionState {
            peer: connection.remote_peer().clone(),
            connection: connection.id(),
            state: next,
        });
        true
    }

    /// failed → closed, and tell the UI the peer is unreachable. The entry stays:
    /// the peer is still in the call.
    fn fail(&self, entry: &mut PeerEntry, error: MeshError) {
        let Some(mut connection) = entry.take_connection() else {
            return;
        };
        tracing::error!(
            peer = %entry.peer_id,
            connection = %connection.id(),
            error = %error,
            "Connection failed"
        );
        self.set_state(&mut connection, ConnectionState::Failed);
        self.retire(connection);
        self.report_unreachable(&entry.peer_id, &error);
    }

    fn retire(&self, mut connection: Connection) {
        if connection.close() {
            self.report_closed(&connection);
        }
    }

    fn report_unreachable(&self, peer: &PeerId, error: &MeshError) {
        let _ = self.notices.send(CallNotice::PeerUnreachable {
            peer: peer.clone(),
            code: error.error_code().to_owned(),
            reason: error.to_string(),
        });
    }
}

/// The entry's connection, if it is still the one with `id` and not closing.
fn current(entry: &mut PeerEntry, id: ConnectionId) -> Option<&mut Connection> {
    entry
        .connection_mut()
        .filter(|c| c.id() == id && !c.is_closing())
}

fn negotiation_error(peer: &PeerId, error: MeshError) -> MeshError {
    match error {
        MeshError::NegotiationFailed { .. } | MeshError::NegotiationTimeout { .. } => error,
        other => MeshError::NegotiationFailed {
            peer: peer.clone(),
            reason: other.to_string(),
        },
    }
}
