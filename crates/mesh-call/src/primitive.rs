//! The peer connection primitive: the external capability that actually talks
//! ICE/DTLS/SRTP to a remote browser.
//!
//! The call logic only drives it through [`PeerConnection`] and listens to the
//! events it reports through [`PeerEvents`].

use crate::connection::ConnectionId;
use crate::media::{MediaTrack, TrackKind};
use crate::session::CallEvent;
use async_trait::async_trait;
use mesh_common::signal::{IceCandidate, IceServer, SessionDescription};
use mesh_common::{MeshResult, PeerId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connectivity as reported by the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A media track received from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    StateChange(TransportState),
    NegotiationNeeded,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> MeshResult<SessionDescription>;

    async fn create_answer(&self) -> MeshResult<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> MeshResult<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> MeshResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()>;

    fn add_track(&self, track: &MediaTrack, stream_id: &str) -> MeshResult<()>;

    fn remove_track(&self, track_id: &str);

    /// Release every resource held by the connection. Must be idempotent.
    fn close(&self);
}

/// Creates one primitive per remote peer.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        remote: &PeerId,
        ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> MeshResult<Arc<dyn PeerConnection>>;
}

/// Event sink handed to a primitive, bound to the connection it belongs to.
///
/// Events from a connection that has since been replaced or closed are
/// discarded by the call loop, so primitives may keep emitting after `close`.
#[derive(Clone)]
pub struct PeerEvents {
    peer: PeerId,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl PeerEvents {
    pub(crate) fn new(
        peer: PeerId,
        connection: ConnectionId,
        tx: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            peer,
            connection,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns false once the call session has shut down.
    pub fn emit(&self, event: PeerConnectionEvent) -> bool {
        self.tx
            .send(CallEvent::Primitive {
                peer: self.peer.clone(),
                connection: self.connection,
                event,
            })
            .is_ok()
    }
}
