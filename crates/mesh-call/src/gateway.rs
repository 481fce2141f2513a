//! Signaling gateway — a thin adapter between the negotiator and the external
//! signaling transport.
//!
//! Outbound: description and candidate events become [`SignalingMessage`]s
//! addressed to exactly one peer. Inbound: messages are decoded and dispatched
//! by kind to a [`SignalHandler`], keyed by the sending peer.

use mesh_common::signal::{IceCandidate, SessionDescription, SignalKind, SignalingMessage};
use mesh_common::{MeshError, MeshResult, PeerId};
use std::sync::Arc;

/// The external message bus. Fire-and-forget: implementations enqueue and
/// return without waiting for delivery.
pub trait SignalingTransport: Send + Sync {
    fn send(&self, message: SignalingMessage) -> MeshResult<()>;
}

/// Receives decoded inbound signaling.
pub trait SignalHandler {
    fn on_offer(&mut self, from: PeerId, offer: SessionDescription);

    fn on_answer(&mut self, from: PeerId, answer: SessionDescription);

    fn on_ice_candidate(&mut self, from: PeerId, candidate: IceCandidate);

    /// A known kind whose payload could not be decoded.
    fn on_malformed(&mut self, from: PeerId, kind: &SignalKind, error: MeshError) {
        tracing::warn!(
            peer = %from,
            kind = %kind,
            error = %error,
            "Dropping malformed signaling message"
        );
    }
}

#[derive(Clone)]
pub struct SignalingGateway {
    local: PeerId,
    transport: Arc<dyn SignalingTransport>,
}

impl SignalingGateway {
    pub fn new(local: PeerId, transport: Arc<dyn SignalingTransport>) -> Self {
        Self { local, transport }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Relay a message. Failures are logged and returned; they never roll back
    /// negotiation state.
    pub fn send(&self, message: SignalingMessage) -> MeshResult<()> {
        let to = message.to_peer.clone();
        let kind = message.kind.clone();
        self.transport.send(message).map_err(|e| {
            let e = match e {
                MeshError::SignalingSendFailure { .. } => e,
                other => MeshError::SignalingSendFailure {
                    peer: to.clone(),
                    reason: other.to_string(),
                },
            };
            tracing::warn!(peer = %to, kind = %kind, error = %e, "Signaling send failed");
            e
        })
    }

    pub fn send_offer(&self, to: &PeerId, offer: &SessionDescription) -> MeshResult<()> {
        self.send(SignalingMessage::offer(&self.local, to, offer)?)
    }

    pub fn send_answer(&self, to: &PeerId, answer: &SessionDescription) -> MeshResult<()> {
        self.send(SignalingMessage::answer(&self.local, to, answer)?)
    }

    pub fn send_ice_candidate(&self, to: &PeerId, candidate: &IceCandidate) -> MeshResult<()> {
        self.send(SignalingMessage::ice_candidate(&self.local, to, candidate)?)
    }

    /// Decode an inbound message and hand it to `handler`.
    pub fn on_receive<H: SignalHandler + ?Sized>(&self, message: SignalingMessage, handler: &mut H) {
        if message.to_peer != self.local {
            tracing::debug!(
                to = %message.to_peer,
                from = %message.from_peer,
                "Ignoring signaling message addressed to another peer"
            );
            return;
        }
        if message.from_peer == self.local {
            tracing::debug!("Ignoring signaling message from ourselves");
            return;
        }

        let from = message.from_peer.clone();
        match &message.kind {
            SignalKind::Offer => match message.decode::<SessionDescription>() {
                Ok(offer) => handler.on_offer(from, offer),
                Err(e) => handler.on_malformed(from, &message.kind, e),
            },
            SignalKind::Answer => match message.decode::<SessionDescription>() {
                Ok(answer) => handler.on_answer(from, answer),
                Err(e) => handler.on_malformed(from, &message.kind, e),
            },
            SignalKind::IceCandidate => match message.decode::<IceCandidate>() {
                Ok(candidate) => handler.on_ice_candidate(from, candidate),
                Err(e) => handler.on_malformed(from, &message.kind, e),
            },
            SignalKind::Unknown(kind) => {
                tracing::warn!(peer = %from, kind = %kind, "Ignoring unknown signaling kind");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<SignalingMessage>>,
    }

    impl SignalingTransport for Recorder {
        fn send(&self, message: SignalingMessage) -> MeshResult<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct Closed;

    impl SignalingTransport for Closed {
        fn send(&self, _message: SignalingMessage) -> MeshResult<()> {
            Err(MeshError::Transport("bus closed".into()))
        }
    }

    #[derive(Default)]
    struct Seen {
        offers: Vec<PeerId>,
        answers: Vec<PeerId>,
        candidates: Vec<PeerId>,
        malformed: Vec<PeerId>,
    }

    impl SignalHandler for Seen {
        fn on_offer(&mut self, from: PeerId, _offer: SessionDescription) {
            self.offers.push(from);
        }

        fn on_answer(&mut self, from: PeerId, _answer: SessionDescription) {
            self.answers.push(from);
        }

        fn on_ice_candidate(&mut self, from: PeerId, _candidate: IceCandidate) {
            self.candidates.push(from);
        }

        fn on_malformed(&mut self, from: PeerId, _kind: &SignalKind, _error: MeshError) {
            self.malformed.push(from);
        }
    }

    fn alice() -> PeerId {
        PeerId::from("alice")
    }

    fn bob() -> PeerId {
        PeerId::from("bob")
    }

    #[test]
    fn outbound_messages_are_addressed_to_one_peer() {
        let recorder = Arc::new(Recorder::default());
        let gateway = SignalingGateway::new(alice(), recorder.clone());

        gateway
            .send_offer(&bob(), &SessionDescription::offer("v=0"))
            .unwrap();
        gateway
            .send_ice_candidate(&bob(), &IceCandidate::new("candidate:1"))
            .unwrap();

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.to_peer == bob() && m.from_peer == alice()));
        assert_eq!(sent[0].kind, SignalKind::Offer);
        assert_eq!(sent[1].kind, SignalKind::IceCandidate);
    }

    #[test]
    fn send_failures_are_reported_as_signaling_failures() {
        let gateway = SignalingGateway::new(alice(), Arc::new(Closed));
        let err = gateway
            .send_answer(&bob(), &SessionDescription::answer("v=0"))
            .unwrap_err();
        assert!(matches!(err, MeshError::SignalingSendFailure { ref peer, .. } if *peer == bob()));
    }

    #[test]
    fn inbound_messages_dispatch_by_kind() {
        let gateway = SignalingGateway::new(alice(), Arc::new(Recorder::default()));
        let mut seen = Seen::default();

        let offer = SignalingMessage::offer(&bob(), &alice(), &SessionDescription::offer("v=0")).unwrap();
        let answer =
            SignalingMessage::answer(&bob(), &alice(), &SessionDescription::answer("v=0")).unwrap();
        let candidate =
            SignalingMessage::ice_candidate(&bob(), &alice(), &IceCandidate::new("candidate:1"))
                .unwrap();
        for message in [offer, answer, candidate] {
            gateway.on_receive(message, &mut seen);
        }

        assert_eq!(seen.offers, vec![bob()]);
        assert_eq!(seen.answers, vec![bob()]);
        assert_eq!(seen.candidates, vec![bob()]);
    }

    #[test]
    fn unknown_kinds_and_misaddressed_messages_are_ignored() {
        let gateway = SignalingGateway::new(alice(), Arc::new(Recorder::default()));
        let mut seen = Seen::default();

        let unknown = SignalingMessage {
            to_peer: alice(),
            from_peer: bob(),
            kind: SignalKind::Unknown("mute".into()),
            payload: serde_json::json!({ "muted": true }),
        };
        let misaddressed =
            SignalingMessage::offer(&bob(), &PeerId::from("carol"), &SessionDescription::offer("v=0"))
                .unwrap();
        gateway.on_receive(unknown, &mut seen);
        gateway.on_receive(misaddressed, &mut seen);

        assert!(seen.offers.is_empty());
        assert!(seen.malformed.is_empty());
    }

    #[test]
    fn malformed_payload_reaches_the_handler() {
        let gateway = SignalingGateway::new(alice(), Arc::new(Recorder::default()));
        let mut seen = Seen::default();

        let message = SignalingMessage {
            to_peer: alice(),
            from_peer: bob(),
            kind: SignalKind::Offer,
            payload: serde_json::json!("not a description"),
        };
        gateway.on_receive(message, &mut seen);

        assert_eq!(seen.malformed, vec![bob()]);
        assert!(seen.offers.is_empty());
    }
}
