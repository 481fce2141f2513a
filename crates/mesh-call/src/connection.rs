//! One peer-to-peer media session with a single remote peer.
//!
//! ```text
//!   new ──▶ negotiating ──▶ connected ◀──▶ disconnected
//!              │                │               │
//!              └──────┬─────────┴───────────────┘
//!                     ▼
//!                   failed ──▶ closed   (closed is reachable from every state)
//! ```
//!
//! Operations on the primitive run on a per-connection worker task, strictly in
//! submission order. Each completed step re-enters the call loop as an event.
//! Closing cancels the worker, so a step still in flight never reports back.

use crate::media::LocalStream;
use crate::primitive::{PeerConnection, RemoteTrack};
use crate::session::CallEvent;
use chrono::{DateTime, Utc};
use mesh_common::signal::{IceCandidate, SessionDescription};
use mesh_common::{MeshError, MeshResult, PeerId};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifies one connection instance for the lifetime of a call session.
/// A replacement connection for the same peer always gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (New, Negotiating) => true,
            (Negotiating, Connected | Disconnected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connected) => true,
            _ => false,
        }
    }

    /// Negotiating or later, and not torn down.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Negotiating | ConnectionState::Connected | ConnectionState::Disconnected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A negotiation step executed on the worker.
#[derive(Debug)]
pub(crate) enum Op {
    CreateOffer,
    AcceptOffer(SessionDescription),
    AcceptAnswer(SessionDescription),
    AddRemoteCandidate(IceCandidate),
}

/// Completion of an [`Op`], delivered back to the call loop.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    LocalOffer(SessionDescription),
    LocalAnswer(SessionDescription),
    RemoteAnswerApplied,
    CandidateApplied,
    CandidateRejected(MeshError),
    Failed(MeshError),
}

pub struct Connection {
    id: ConnectionId,
    remote_peer: PeerId,
    role: Role,
    state: ConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Whether the local description reached the transport.
    description_sent: bool,
    offer_in_flight: bool,
    /// Locally gathered candidates not yet handed to the transport.
    ice_candidates: VecDeque<IceCandidate>,
    /// Candidates the transport accepted, kept for a resend.
    sent_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrack>,
    attached_tracks: Vec<String>,
    transport_connected: bool,
    created_at: DateTime<Utc>,
    pc: Arc<dyn PeerConnection>,
    ops: mpsc::UnboundedSender<Op>,
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap a freshly created primitive and start its worker and negotiation
    /// deadline. The connection starts in `new`.
    pub(crate) fn open(
        id: ConnectionId,
        remote_peer: PeerId,
        role: Role,
        pc: Arc<dyn PeerConnection>,
        events: mpsc::UnboundedSender<CallEvent>,
        negotiation_timeout: Duration,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_worker(
            remote_peer.clone(),
            id,
            pc.clone(),
            ops_rx,
            cancel.clone(),
            events.clone(),
        ));

        let deadline_peer = remote_peer.clone();
        let deadline_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline_cancel.cancelled() => {}
                _ = tokio::time::sleep(negotiation_timeout) => {
                    let _ = events.send(CallEvent::NegotiationDeadline {
                        peer: deadline_peer,
                        connection: id,
                    });
                }
            }
        });

        Self {
            id,
            remote_peer,
            role,
            state: ConnectionState::New,
            local_description: None,
            remote_description: None,
            description_sent: false,
            offer_in_flight: false,
            ice_candidates: VecDeque::new(),
            sent_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            attached_tracks: Vec::new(),
            transport_connected: false,
            created_at: Utc::now(),
            pc,
            ops: ops_tx,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn description_sent(&self) -> bool {
        self.description_sent
    }

    pub fn queued_candidates(&self) -> usize {
        self.ice_candidates.len()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn attached_tracks(&self) -> &[String] {
        &self.attached_tracks
    }

    /// Closed, or cancellation already requested.
    pub fn is_closing(&self) -> bool {
        self.state == ConnectionState::Closed || self.cancel.is_cancelled()
    }

    pub(crate) fn submit(&mut self, op: Op) {
        if self.is_closing() {
            return;
        }
        if matches!(op, Op::CreateOffer) {
            self.offer_in_flight = true;
        }
        // A closed channel means the worker is gone; the deadline will fail us.
        let _ = self.ops.send(op);
    }

    pub(crate) fn offer_in_flight(&self) -> bool {
        self.offer_in_flight
    }

    /// Attach every live local track. Tracks the primitive rejects are skipped.
    pub(crate) fn attach_tracks(&mut self, stream: &LocalStream) {
        for track in stream.live_tracks() {
            match self.pc.add_track(track, &stream.id) {
                Ok(()) => self.attached_tracks.push(track.id.clone()),
                Err(e) => tracing::warn!(
                    peer = %self.remote_peer,
                    track = %track.id,
                    error = %e,
                    "Failed to attach local track"
                ),
            }
        }
    }

    pub(crate) fn detach_tracks(&mut self) {
        for track_id in self.attached_tracks.drain(..) {
            self.pc.remove_track(&track_id);
        }
    }

    /// Apply a state transition. Returns false (and changes nothing) when the
    /// transition is not allowed from the current state.
    pub(crate) fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next || !self.state.can_transition_to(next) {
            return false;
        }
        tracing::debug!(
            peer = %self.remote_peer,
            connection = %self.id,
            from = %self.state,
            to = %next,
            "Connection state changed"
        );
        self.state = next;
        true
    }

    /// The state connectivity facts call for, if it differs from the current one.
    ///
    /// Connected needs both ICE success and at least one received remote track.
    pub(crate) fn connectivity_target(&self) -> Option<ConnectionState> {
        let ready = self.transport_connected && !self.remote_tracks.is_empty();
        match self.state {
            ConnectionState::Negotiating | ConnectionState::Disconnected if ready => {
                Some(ConnectionState::Connected)
            }
            _ => None,
        }
    }

    pub(crate) fn set_transport_connected(&mut self, connected: bool) {
        self.transport_connected = connected;
    }

    pub(crate) fn transport_connected(&self) -> bool {
        self.transport_connected
    }

    pub(crate) fn add_remote_track(&mut self, track: RemoteTrack) -> bool {
        if self.remote_tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.remote_tracks.push(track);
        true
    }

    pub(crate) fn set_local_description(&mut self, desc: SessionDescription) {
        self.local_description = Some(desc);
        self.description_sent = false;
    }

    pub(crate) fn set_remote_description(&mut self, desc: SessionDescription) {
        self.remote_description = Some(desc);
    }

    pub(crate) fn mark_description_sent(&mut self) {
        self.description_sent = true;
    }

    pub(crate) fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.ice_candidates.push_back(candidate);
    }

    pub(crate) fn front_candidate(&self) -> Option<&IceCandidate> {
        self.ice_candidates.front()
    }

    pub(crate) fn pop_candidate(&mut self) {
        if let Some(candidate) = self.ice_candidates.pop_front() {
            self.sent_candidates.push(candidate);
        }
    }

    /// Whether the remote side has yet to show it received our description.
    /// An offerer knows once the answer arrives; an answerer once ICE connects.
    pub(crate) fn unacknowledged(&self) -> bool {
        match self.role {
            Role::Offerer => self.remote_description.is_none(),
            Role::Answerer => {
                self.state == ConnectionState::Negotiating && !self.transport_connected
            }
        }
    }

    /// Forget what the transport accepted, so the next flush repeats the local
    /// description followed by every candidate in gathering order.
    pub(crate) fn rewind(&mut self) {
        self.description_sent = false;
        for candidate in self.sent_candidates.drain(..).rev() {
            self.ice_candidates.push_front(candidate);
        }
    }

    /// Tear down: cancel pending steps, detach tracks, drop queued candidates,
    /// release the primitive. Idempotent; returns whether anything happened.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.cancel.cancel();
        self.detach_tracks();
        self.ice_candidates.clear();
        self.sent_candidates.clear();
        self.pc.close();
        self.state = ConnectionState::Closed;
        tracing::info!(
            peer = %self.remote_peer,
            connection = %self.id,
            "Connection closed"
        );
        true
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            role: self.role,
            state: self.state,
            description_sent: self.description_sent,
            has_remote_description: self.remote_description.is_some(),
            queued_candidates: self.ice_candidates.len(),
            remote_tracks: self.remote_tracks.len(),
            created_at: self.created_at,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read-only view of a connection, for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub role: Role,
    pub state: ConnectionState,
    pub description_sent: bool,
    pub has_remote_description: bool,
    pub queued_candidates: usize,
    pub remote_tracks: usize,
    pub created_at: DateTime<Utc>,
}

/// Execute steps for one connection, in order, until cancelled.
async fn run_worker(
    peer: PeerId,
    connection: ConnectionId,
    pc: Arc<dyn PeerConnection>,
    mut ops: mpsc::UnboundedReceiver<Op>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<CallEvent>,
) {
    loop {
        let op = tokio::select! {
            _ = cancel.cancelled() => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = execute(pc.as_ref(), op, &cancel) => outcome,
        };

        // Re-check: cancellation may have raced the last await.
        let Some(outcome) = outcome else { break };
        if cancel.is_cancelled() {
            break;
        }
        let event = CallEvent::Step {
            peer: peer.clone(),
            connection,
            outcome,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    tracing::trace!(peer = %peer, connection = %connection, "Connection worker stopped");
}

/// Run one step. `None` means it was cancelled between two awaits.
async fn execute(
    pc: &dyn PeerConnection,
    op: Op,
    cancel: &CancellationToken,
) -> Option<StepOutcome> {
    let result = match op {
        Op::CreateOffer => create_offer(pc, cancel).await,
        Op::AcceptOffer(offer) => accept_offer(pc, offer, cancel).await,
        Op::AcceptAnswer(answer) => pc
            .set_remote_description(answer)
            .await
            .map(|()| Some(StepOutcome::RemoteAnswerApplied)),
        Op::AddRemoteCandidate(candidate) => {
            return Some(match pc.add_ice_candidate(candidate).await {
                Ok(()) => StepOutcome::CandidateApplied,
                Err(e) => StepOutcome::CandidateRejected(e),
            });
        }
    };
    match result {
        Ok(outcome) => outcome,
        Err(e) => Some(StepOutcome::Failed(e)),
    }
}

async fn create_offer(
    pc: &dyn PeerConnection,
    cancel: &CancellationToken,
) -> MeshResult<Option<StepOutcome>> {
    let offer = pc.create_offer().await?;
    if cancel.is_cancelled() {
        return Ok(None);
    }
    pc.set_local_description(offer.clone()).await?;
    Ok(Some(StepOutcome::LocalOffer(offer)))
}

async fn accept_offer(
    pc: &dyn PeerConnection,
    offer: SessionDescription,
    cancel: &CancellationToken,
) -> MeshResult<Option<StepOutcome>> {
    pc.set_remote_description(offer).await?;
    if cancel.is_cancelled() {
        return Ok(None);
    }
    let answer = pc.create_answer().await?;
    if cancel.is_cancelled() {
        return Ok(None);
    }
    pc.set_local_description(answer.clone()).await?;
    Ok(Some(StepOutcome::LocalAnswer(answer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn closed_is_terminal() {
        for next in [New, Negotiating, Connected, Disconnected, Failed, Closed] {
            assert!(!Closed.can_transition_to(next), "closed -> {next}");
        }
    }

    #[test]
    fn every_live_state_can_close_or_fail() {
        for state in [New, Negotiating, Connected, Disconnected] {
            assert!(state.can_transition_to(Closed));
            assert!(state.can_transition_to(Failed));
        }
        assert!(Failed.can_transition_to(Closed));
        assert!(!Failed.can_transition_to(Connected));
    }

    #[test]
    fn recovery_without_renegotiation() {
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Negotiating.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Negotiating));
        assert!(!Connected.can_transition_to(Negotiating));
    }

    #[test]
    fn new_only_moves_to_negotiating() {
        assert!(New.can_transition_to(Negotiating));
        assert!(!New.can_transition_to(Connected));
        assert!(!New.can_transition_to(Disconnected));
    }
}
