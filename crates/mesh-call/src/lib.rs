//! # mesh-call
//!
//! Peer connection lifecycle and signaling state machine for full-mesh calls.
//! Every participant holds one direct connection to every other participant.
//!
//! Architecture: one event loop per call session
//! - Local media is acquired once and shared read-only by every connection
//! - The peer registry owns one entry (and at most one connection) per remote
//! - The negotiator runs offer/answer/candidate exchange, resolving glare with
//!   a deterministic tie-break (the smaller peer id offers)
//! - Signaling goes through an external transport, fire-and-forget
//! - Slow work (capture, description generation) runs off the loop and comes
//!   back as events that are re-validated before they touch anything

pub mod connection;
pub mod gateway;
pub mod loopback;
pub mod media;
pub mod negotiator;
pub mod primitive;
pub mod registry;
pub mod session;

pub use connection::{ConnectionId, ConnectionState, Role};
pub use gateway::{SignalingGateway, SignalingTransport};
pub use media::{CaptureDevice, LocalStream, MediaStatus, MediaTrack, TrackKind};
pub use primitive::{PeerConnection, PeerConnectionEvent, PeerConnectionFactory, PeerEvents};
pub use session::{CallDeps, CallHandle, CallNotice, CallSnapshot};
