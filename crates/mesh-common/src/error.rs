//! Centralized error types for mesh calls.
//!
//! Every failure a call can observe maps to one `MeshError` variant. Most of them
//! are recoverable from the call's point of view: callers decide whether an error
//! degrades a single peer, gets logged and dropped, or bubbles up.

use crate::peer::PeerId;

/// Core error type used across all mesh crates.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    // === Local media ===
    #[error("Local media unavailable: {reason}")]
    MediaUnavailable { reason: String },

    // === Registry misuse ===
    #[error("Peer {peer} already present")]
    AlreadyPresent { peer: PeerId },

    #[error("Peer {peer} not found")]
    NotFound { peer: PeerId },

    // === Protocol ===
    #[error("ICE candidate from {peer} has no connection to apply to")]
    OrphanCandidate { peer: PeerId },

    #[error("Malformed {kind} payload from {peer}: {reason}")]
    MalformedPayload {
        peer: PeerId,
        kind: String,
        reason: String,
    },

    // === Negotiation ===
    #[error("Negotiation with {peer} timed out after {timeout_ms}ms")]
    NegotiationTimeout { peer: PeerId, timeout_ms: u64 },

    #[error("Negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: PeerId, reason: String },

    // === Signaling ===
    #[error("Failed to send signaling message to {peer}: {reason}")]
    SignalingSendFailure { peer: PeerId, reason: String },

    #[error("Signaling transport error: {0}")]
    Transport(String),

    // === Infrastructure ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MeshError {
    /// Error code string for programmatic handling (logs, UI notices).
    pub fn error_code(&self) -> &str {
        match self {
            Self::MediaUnavailable { .. } => "MEDIA_UNAVAILABLE",
            Self::AlreadyPresent { .. } => "ALREADY_PRESENT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::OrphanCandidate { .. } => "ORPHAN_CANDIDATE",
            Self::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            Self::NegotiationTimeout { .. } => "NEGOTIATION_TIMEOUT",
            Self::NegotiationFailed { .. } => "NEGOTIATION_FAILED",
            Self::SignalingSendFailure { .. } => "SIGNALING_SEND_FAILURE",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Benign errors are expected under at-least-once delivery and repeated
    /// lifecycle events. Callers treat them as no-ops.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::AlreadyPresent { .. } | Self::NotFound { .. } | Self::OrphanCandidate { .. }
        )
    }

    /// Whether the error ends the connection it occurred on.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Self::NegotiationTimeout { .. }
                | Self::NegotiationFailed { .. }
                | Self::MalformedPayload { .. }
        )
    }
}

/// Convenience type alias for Results using MeshError.
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_are_benign() {
        let peer = PeerId::from("alice");
        assert!(MeshError::AlreadyPresent { peer: peer.clone() }.is_benign());
        assert!(MeshError::NotFound { peer: peer.clone() }.is_benign());
        assert!(MeshError::OrphanCandidate { peer: peer.clone() }.is_benign());
        assert!(!MeshError::NegotiationFailed {
            peer,
            reason: "bad sdp".into()
        }
        .is_benign());
    }

    #[test]
    fn negotiation_errors_end_the_connection() {
        let peer = PeerId::from("bob");
        let timeout = MeshError::NegotiationTimeout {
            peer: peer.clone(),
            timeout_ms: 100,
        };
        assert!(timeout.is_fatal_for_connection());
        assert_eq!(timeout.error_code(), "NEGOTIATION_TIMEOUT");

        let send = MeshError::SignalingSendFailure {
            peer,
            reason: "closed".into(),
        };
        assert!(!send.is_fatal_for_connection());
    }
}
