//! Events delivered by a signaling transport to one call participant.
//!
//! Lives in `mesh-common` so both the transports and the call crate can use it
//! without depending on each other.

use crate::peer::PeerId;
use crate::signal::SignalingMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A participant is present in the call (newly joined, or already there
    /// when we subscribed).
    PeerJoined { peer_id: PeerId },

    /// A participant left the call or lost its transport connection.
    PeerLeft { peer_id: PeerId },

    /// The signaling server asks us to call this peer.
    OfferRequested { peer_id: PeerId },

    /// A signaling message addressed to us.
    Signal(SignalingMessage),
}
