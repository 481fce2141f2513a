//! Signaling wire types: the envelope relayed between peers and its payloads.
//!
//! Media never flows through signaling. Only session descriptions (offer and
//! answer) and ICE candidates are relayed, each addressed to a single peer.

use crate::error::{MeshError, MeshResult};
use crate::peer::PeerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminates the payload of a [`SignalingMessage`].
///
/// Kinds this client does not understand are preserved as `Unknown` so newer
/// peers can introduce message kinds without breaking older ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Unknown(String),
}

impl SignalKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for SignalKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "offer" | "new_sdp_offer" => Self::Offer,
            "answer" | "new_answer" => Self::Answer,
            "ice-candidate" | "new_ice_candidate" => Self::IceCandidate,
            _ => Self::Unknown(kind),
        }
    }
}

impl From<SignalKind> for String {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Unknown(other) => other,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a description opens or answers a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP session description. Opaque to the call logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate, in the shape browsers hand them out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Envelope relayed by the signaling transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub to_peer: PeerId,
    pub from_peer: PeerId,
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SignalingMessage {
    fn build(
        from: &PeerId,
        to: &PeerId,
        kind: SignalKind,
        payload: &impl Serialize,
    ) -> MeshResult<Self> {
        Ok(Self {
            to_peer: to.clone(),
            from_peer: from.clone(),
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn offer(from: &PeerId, to: &PeerId, desc: &SessionDescription) -> MeshResult<Self> {
        Self::build(from, to, SignalKind::Offer, desc)
    }

    pub fn answer(from: &PeerId, to: &PeerId, desc: &SessionDescription) -> MeshResult<Self> {
        Self::build(from, to, SignalKind::Answer, desc)
    }

    pub fn ice_candidate(from: &PeerId, to: &PeerId, cand: &IceCandidate) -> MeshResult<Self> {
        Self::build(from, to, SignalKind::IceCandidate, cand)
    }

    /// Decode the payload into its typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> MeshResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| MeshError::MalformedPayload {
            peer: self.from_peer.clone(),
            kind: self.kind.to_string(),
            reason: e.to_string(),
        })
    }
}

/// ICE server configuration (STUN/TURN) handed to every peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_camel_case_fields() {
        let msg = SignalingMessage::offer(
            &PeerId::from("alice"),
            &PeerId::from("bob"),
            &SessionDescription::offer("v=0"),
        )
        .unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["toPeer"], "bob");
        assert_eq!(json["fromPeer"], "alice");
        assert_eq!(json["kind"], "offer");
        assert_eq!(json["payload"]["type"], "offer");
        assert_eq!(json["payload"]["sdp"], "v=0");
    }

    #[test]
    fn unknown_kind_survives_deserialization() {
        let raw = r#"{"toPeer":"bob","fromPeer":"alice","kind":"screen-share","payload":{}}"#;
        let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, SignalKind::Unknown("screen-share".into()));
        assert_eq!(serde_json::to_value(&msg).unwrap()["kind"], "screen-share");
    }

    #[test]
    fn legacy_event_names_map_to_kinds() {
        assert_eq!(SignalKind::from("new_sdp_offer".to_owned()), SignalKind::Offer);
        assert_eq!(SignalKind::from("new_answer".to_owned()), SignalKind::Answer);
        assert_eq!(
            SignalKind::from("new_ice_candidate".to_owned()),
            SignalKind::IceCandidate
        );
    }

    #[test]
    fn candidate_matches_browser_shape() {
        let raw = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let cand: IceCandidate = serde_json::from_str(raw).unwrap();
        assert_eq!(cand.sdp_mid.as_deref(), Some("0"));
        assert_eq!(cand.sdp_m_line_index, Some(0));
    }

    #[test]
    fn malformed_payload_names_the_sender() {
        let msg = SignalingMessage {
            to_peer: PeerId::from("bob"),
            from_peer: PeerId::from("alice"),
            kind: SignalKind::Answer,
            payload: serde_json::json!({ "sdp": 42 }),
        };
        let err = msg.decode::<SessionDescription>().unwrap_err();
        match err {
            MeshError::MalformedPayload { peer, kind, .. } => {
                assert_eq!(peer, PeerId::from("alice"));
                assert_eq!(kind, "answer");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
