//! In-process implementations of the capture device and the peer connection
//! primitive.
//!
//! [`LoopbackNetwork`] pairs up the primitives of every simulated participant:
//! once both ends of a pair hold matching local and remote descriptions, each
//! end reports ICE success followed by the tracks announced in the other
//! end's description. Used by the simulator and the end-to-end tests.

use crate::media::{CaptureDevice, LocalStream, MediaTrack, TrackKind};
use crate::primitive::{
    PeerConnection, PeerConnectionEvent, PeerConnectionFactory, PeerEvents, RemoteTrack,
    TransportState,
};
use async_trait::async_trait;
use mesh_common::config::MediaConfig;
use mesh_common::signal::{IceCandidate, IceServer, SdpType, SessionDescription};
use mesh_common::{MeshError, MeshResult, PeerId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Candidates every loopback primitive gathers after its local description.
const CANDIDATES_PER_CONNECTION: u16 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================
// Capture device
// ============================================================

/// A capture device that hands out synthetic tracks, or refuses to.
#[derive(Default)]
pub struct LoopbackDevice {
    deny: bool,
    delay: Duration,
    active: AtomicUsize,
}

impl LoopbackDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A device whose permission prompt is always declined.
    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            ..Self::default()
        })
    }

    /// A device that takes `delay` to start capturing.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    /// Streams handed out and not yet released.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for LoopbackDevice {
    async fn request_capture(&self, constraints: &MediaConfig) -> MeshResult<LocalStream> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.deny {
            return Err(MeshError::MediaUnavailable {
                reason: "permission denied".into(),
            });
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        if tracks.is_empty() {
            return Err(MeshError::MediaUnavailable {
                reason: "neither audio nor video requested".into(),
            });
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream::new(tracks))
    }

    fn released(&self, _stream: &LocalStream) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

// ============================================================
// Network
// ============================================================

#[derive(Default)]
struct NetworkState {
    /// Latest primitive created by `.0` towards `.1`.
    endpoints: HashMap<(PeerId, PeerId), Weak<LoopbackConnection>>,
    /// Pairs whose ICE checks never succeed.
    blocked: HashSet<(PeerId, PeerId)>,
    created: usize,
}

/// Shared medium connecting every loopback primitive of a simulation.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    latency: Duration,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every primitive operation and event is delayed by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Primitive factory for participant `local`.
    pub fn factory(&self, local: PeerId) -> Arc<LoopbackFactory> {
        Arc::new(LoopbackFactory {
            network: self.clone(),
            local,
        })
    }

    /// Primitives created so far, including closed ones.
    pub fn created(&self) -> usize {
        lock(&self.state).created
    }

    /// Primitives still alive and not closed.
    pub fn open_connections(&self) -> usize {
        lock(&self.state)
            .endpoints
            .values()
            .filter_map(Weak::upgrade)
            .filter(|endpoint| !endpoint.is_closed())
            .count()
    }

    /// Make ICE between `a` and `b` never succeed.
    pub fn block(&self, a: &PeerId, b: &PeerId) {
        lock(&self.state).blocked.insert(pair(a, b));
    }

    /// Transient loss of connectivity between `a` and `b`.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        self.report(a, b, TransportState::Disconnected);
    }

    /// Connectivity between `a` and `b` recovers.
    pub fn restore(&self, a: &PeerId, b: &PeerId) {
        self.report(a, b, TransportState::Connected);
    }

    /// Permanent ICE failure between `a` and `b`.
    pub fn fail(&self, a: &PeerId, b: &PeerId) {
        self.report(a, b, TransportState::Failed);
    }

    fn report(&self, a: &PeerId, b: &PeerId, state: TransportState) {
        for endpoint in [self.endpoint(a, b), self.endpoint(b, a)].into_iter().flatten() {
            if endpoint.is_connected() {
                endpoint.emit(vec![PeerConnectionEvent::StateChange(state)]);
            }
        }
    }

    fn endpoint(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<LoopbackConnection>> {
        lock(&self.state)
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .and_then(Weak::upgrade)
    }

    fn is_blocked(&self, a: &PeerId, b: &PeerId) -> bool {
        lock(&self.state).blocked.contains(&pair(a, b))
    }

    fn register(&self, endpoint: &Arc<LoopbackConnection>) {
        let mut state = lock(&self.state);
        state.created += 1;
        state.endpoints.insert(
            (endpoint.local.clone(), endpoint.remote.clone()),
            Arc::downgrade(endpoint),
        );
    }
}

fn pair(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

pub struct LoopbackFactory {
    network: LoopbackNetwork,
    local: PeerId,
}

impl PeerConnectionFactory for LoopbackFactory {
    fn create(
        &self,
        remote: &PeerId,
        ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> MeshResult<Arc<dyn PeerConnection>> {
        tracing::trace!(
            local = %self.local,
            remote = %remote,
            ice_servers = ice_servers.len(),
            "Creating loopback peer connection"
        );
        let endpoint = Arc::new(LoopbackConnection {
            local: self.local.clone(),
            remote: remote.clone(),
            session: Uuid::new_v4().simple().to_string(),
            events,
            network: self.network.clone(),
            state: Mutex::new(EndpointState::default()),
        });
        self.network.register(&endpoint);
        Ok(endpoint)
    }
}

// ============================================================
// Primitive
// ============================================================

#[derive(Default)]
struct EndpointState {
    tracks: Vec<(String, TrackKind, String)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    gathered: u16,
    connected: bool,
    closed: bool,
}

pub struct LoopbackConnection {
    local: PeerId,
    remote: PeerId,
    session: String,
    events: PeerEvents,
    network: LoopbackNetwork,
    state: Mutex<EndpointState>,
}

impl LoopbackConnection {
    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn is_connected(&self) -> bool {
        let state = lock(&self.state);
        state.connected && !state.closed
    }

    fn emit(&self, events: Vec<PeerConnectionEvent>) {
        let sink = self.events.clone();
        let latency = self.network.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            for event in events {
                if !sink.emit(event) {
                    break;
                }
            }
        });
    }

    async fn delay(&self) {
        if !self.network.latency.is_zero() {
            tokio::time::sleep(self.network.latency).await;
        }
    }

    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let state = lock(&self.state);
        let mut sdp = format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns={}\r\n",
            self.session, self.local
        );
        for (track_id, kind, stream_id) in &state.tracks {
            let media = match kind {
                TrackKind::Audio => "audio 9 UDP/TLS/RTP/SAVPF 111",
                TrackKind::Video => "video 9 UDP/TLS/RTP/SAVPF 96",
            };
            sdp.push_str(&format!("m={media}\r\na=msid:{stream_id} {track_id}\r\n"));
        }
        SessionDescription { sdp_type, sdp }
    }

    /// Both ends hold each other's descriptions: report connectivity.
    fn try_connect(&self) {
        let Some(other) = self.network.endpoint(&self.remote, &self.local) else {
            return;
        };
        let (mine_local, mine_remote) = {
            let state = lock(&self.state);
            (state.local.clone(), state.remote.clone())
        };
        let (theirs_local, theirs_remote) = {
            let state = lock(&other.state);
            (state.local.clone(), state.remote.clone())
        };
        let matched = mine_local.is_some()
            && mine_remote.is_some()
            && mine_local == theirs_remote
            && mine_remote == theirs_local;
        if !matched || self.network.is_blocked(&self.local, &self.remote) {
            return;
        }

        self.mark_connected();
        other.mark_connected();
    }

    fn mark_connected(&self) {
        let remote_tracks = {
            let mut state = lock(&self.state);
            if state.connected || state.closed {
                return;
            }
            state.connected = true;
            state
                .remote
                .as_ref()
                .map(|desc| announced_tracks(&desc.sdp))
                .unwrap_or_default()
        };

        let mut events = vec![
            PeerConnectionEvent::StateChange(TransportState::Connecting),
            PeerConnectionEvent::StateChange(TransportState::Connected),
        ];
        events.extend(remote_tracks.into_iter().map(PeerConnectionEvent::Track));
        self.emit(events);
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> MeshResult<SessionDescription> {
        self.delay().await;
        Ok(self.describe(SdpType::Offer))
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        self.delay().await;
        if lock(&self.state).remote.is_none() {
            return Err(MeshError::NegotiationFailed {
                peer: self.remote.clone(),
                reason: "cannot answer without a remote offer".into(),
            });
        }
        Ok(self.describe(SdpType::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> MeshResult<()> {
        self.delay().await;
        let candidates = {
            let mut state = lock(&self.state);
            if state.closed {
                return Ok(());
            }
            state.local = Some(desc);
            let first = state.gathered;
            state.gathered += CANDIDATES_PER_CONNECTION;
            (first..state.gathered)
                .map(|n| {
                    let mut candidate = IceCandidate::new(format!(
                        "candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host",
                        50000 + n
                    ));
                    candidate.sdp_mid = Some("0".into());
                    candidate.sdp_m_line_index = Some(0);
                    PeerConnectionEvent::IceCandidate(candidate)
                })
                .collect()
        };
        self.emit(candidates);
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> MeshResult<()> {
        self.delay().await;
        if !desc.sdp.starts_with("v=0") {
            return Err(MeshError::NegotiationFailed {
                peer: self.remote.clone(),
                reason: "malformed session description".into(),
            });
        }
        lock(&self.state).remote = Some(desc);
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        self.delay().await;
        if lock(&self.state).remote.is_none() {
            return Err(MeshError::NegotiationFailed {
                peer: self.remote.clone(),
                reason: format!("candidate before remote description: {}", candidate.candidate),
            });
        }
        Ok(())
    }

    fn add_track(&self, track: &MediaTrack, stream_id: &str) -> MeshResult<()> {
        let mut state = lock(&self.state);
        if state.tracks.iter().any(|(id, _, _)| *id == track.id) {
            return Err(MeshError::Internal(anyhow::anyhow!(
                "track {} already attached",
                track.id
            )));
        }
        state
            .tracks
            .push((track.id.clone(), track.kind, stream_id.to_owned()));
        Ok(())
    }

    fn remove_track(&self, track_id: &str) {
        lock(&self.state).tracks.retain(|(id, _, _)| id != track_id);
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.connected = false;
        state.tracks.clear();
    }
}

/// Tracks announced through `a=msid:` lines.
fn announced_tracks(sdp: &str) -> Vec<RemoteTrack> {
    let mut kind = None;
    let mut tracks = Vec::new();
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = match media.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            let mut parts = msid.split_whitespace();
            if let (Some(kind), Some(stream_id), Some(id)) = (kind, parts.next(), parts.next()) {
                tracks.push(RemoteTrack {
                    id: id.to_owned(),
                    kind,
                    stream_id: stream_id.to_owned(),
                });
            }
        }
    }
    tracks
}
