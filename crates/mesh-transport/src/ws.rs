//! WebSocket client for a signaling relay server.
//!
//! Frames are JSON objects `{ "op": ..., "d": ... }`. After connecting, the
//! client sends `join` for its call; the server answers with `peer_joined` for
//! every participant already present and keeps relaying lifecycle and
//! `signal` frames. Lost connections are re-established with exponential
//! backoff; outbound signals queued meanwhile, and a frame whose write
//! failed, are sent after the rejoin.

use futures_util::{SinkExt, StreamExt};
use mesh_call::SignalingTransport;
use mesh_common::config::SignalingConfig;
use mesh_common::event::TransportEvent;
use mesh_common::signal::SignalingMessage;
use mesh_common::{MeshError, MeshResult, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Upper bound for the reconnect backoff.
const MAX_BACKOFF_SECS: u64 = 30;

/// A frame on the signaling socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum Frame {
    /// Client → server: enter a call.
    Join { call_id: String, peer_id: PeerId },
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    OfferRequest { peer_id: PeerId },
    Signal(SignalingMessage),
    Heartbeat,
    HeartbeatAck,
}

impl Frame {
    /// The call-level event this frame carries, if any.
    pub fn into_event(self) -> Option<TransportEvent> {
        match self {
            Frame::PeerJoined { peer_id } => Some(TransportEvent::PeerJoined { peer_id }),
            Frame::PeerLeft { peer_id } => Some(TransportEvent::PeerLeft { peer_id }),
            Frame::OfferRequest { peer_id } => Some(TransportEvent::OfferRequested { peer_id }),
            Frame::Signal(message) => Some(TransportEvent::Signal(message)),
            Frame::Join { .. } | Frame::Heartbeat | Frame::HeartbeatAck => None,
        }
    }

    fn to_message(&self) -> MeshResult<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Outbound half handed to the call session.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Frame>,
}

impl SignalingTransport for WsTransport {
    fn send(&self, message: SignalingMessage) -> MeshResult<()> {
        self.outbound
            .send(Frame::Signal(message))
            .map_err(|_| MeshError::Transport("signaling connection closed".into()))
    }
}

/// Connection settings for one participant of one call.
#[derive(Debug, Clone)]
pub struct WsSignaling {
    url: String,
    call_id: String,
    local: PeerId,
    heartbeat_interval: Duration,
    max_reconnect: u32,
}

impl WsSignaling {
    pub fn new(config: &SignalingConfig, call_id: impl Into<String>, local: PeerId) -> MeshResult<Self> {
        let parsed = url::Url::parse(&config.url)
            .map_err(|e| MeshError::Transport(format!("invalid signaling url {}: {e}", config.url)))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(MeshError::Transport(format!(
                "signaling url must use ws:// or wss://, got {}",
                config.url
            )));
        }
        Ok(Self {
            url: config.url.clone(),
            call_id: call_id.into(),
            local,
            heartbeat_interval: Duration::from_secs(config.heartbeat_secs.max(1)),
            max_reconnect: config.max_reconnect,
        })
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Spawn the connection task. Returns the outbound transport, the inbound
    /// event stream, and the task handle. The task ends when every transport
    /// handle is dropped or reconnect attempts run out.
    pub fn connect(
        self,
    ) -> (
        Arc<WsTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
        JoinHandle<()>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut outbox = Outbox::new(outbound_rx);
            let mut attempts = 0u32;
            loop {
                match self.run_once(&mut outbox, &events_tx).await {
                    Ok(Session::Finished) => break,
                    Ok(Session::Dropped) => {
                        attempts = 0;
                        tracing::info!(local = %self.local, "Signaling connection closed by server, reconnecting");
                        sleep(Duration::from_secs(1)).await;
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts > self.max_reconnect {
                            tracing::error!(local = %self.local, error = %e, "Signaling: max reconnect attempts reached");
                            break;
                        }
                        let delay = Duration::from_secs(u64::min(2u64.pow(attempts), MAX_BACKOFF_SECS));
                        tracing::warn!(
                            local = %self.local,
                            error = %e,
                            attempt = attempts,
                            "Signaling disconnected, reconnecting in {delay:?}"
                        );
                        sleep(delay).await;
                    }
                }
            }
        });

        let transport = Arc::new(WsTransport {
            outbound: outbound_tx,
        });
        (transport, events_rx, task)
    }

    async fn run_once(
        &self,
        outbox: &mut Outbox,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> MeshResult<Session> {
        let (ws, _) = connect_async(self.url.as_str()).await.map_err(transport_error)?;
        let (mut sink, mut stream) = ws.split();

        let join = Frame::Join {
            call_id: self.call_id.clone(),
            peer_id: self.local.clone(),
        };
        sink.send(join.to_message()?).await.map_err(transport_error)?;
        tracing::info!(local = %self.local, call = %self.call_id, url = %self.url, "Signaling connected");

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    let Some(inbound) = inbound else {
                        return Ok(Session::Dropped);
                    };
                    let text = match inbound.map_err(transport_error)? {
                        Message::Text(text) => text,
                        Message::Close(_) => return Ok(Session::Dropped),
                        _ => continue,
                    };
                    let frame: Frame = match serde_json::from_str(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring undecodable signaling frame");
                            continue;
                        }
                    };
                    if frame == Frame::HeartbeatAck {
                        tracing::trace!("Signaling heartbeat ack");
                        continue;
                    }
                    if let Some(event) = frame.into_event() {
                        if events.send(event).is_err() {
                            return Ok(Session::Finished);
                        }
                    }
                }
                frame = outbox.next() => {
                    let Some(frame) = frame else {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(Session::Finished);
                    };
                    if let Err(e) = sink.send(frame.to_message()?).await {
                        outbox.retry(frame);
                        return Err(transport_error(e));
                    }
                }
                _ = heartbeat.tick() => {
                    sink.send(Frame::Heartbeat.to_message()?).await.map_err(transport_error)?;
                }
            }
        }
    }
}

/// Outbound frames across reconnects. A frame whose write failed goes out
/// first on the next connection.
struct Outbox {
    frames: mpsc::UnboundedReceiver<Frame>,
    unsent: Option<Frame>,
}

impl Outbox {
    fn new(frames: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            frames,
            unsent: None,
        }
    }

    async fn next(&mut self) -> Option<Frame> {
        if let Some(frame) = self.unsent.take() {
            return Some(frame);
        }
        self.frames.recv().await
    }

    fn retry(&mut self, frame: Frame) {
        self.unsent = Some(frame);
    }
}

/// How a connection ended without an error.
enum Session {
    /// Nobody is listening or sending anymore.
    Finished,
    /// The server went away cleanly; reconnect.
    Dropped,
}

fn transport_error(e: tokio_tungstenite::tungstenite::Error) -> MeshError {
    MeshError::Transport(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_common::signal::{SessionDescription, SignalKind};
    use tokio::net::TcpListener;

    #[test]
    fn frames_use_op_and_d() {
        let frame = Frame::PeerJoined {
            peer_id: PeerId::from("bob"),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "peer_joined");
        assert_eq!(json["d"]["peer_id"], "bob");

        let heartbeat: Frame = serde_json::from_str(r#"{"op":"heartbeat"}"#).unwrap();
        assert_eq!(heartbeat, Frame::Heartbeat);
    }

    #[test]
    fn control_frames_carry_no_call_event() {
        assert!(Frame::Heartbeat.into_event().is_none());
        assert_eq!(
            Frame::OfferRequest {
                peer_id: PeerId::from("carol")
            }
            .into_event(),
            Some(TransportEvent::OfferRequested {
                peer_id: PeerId::from("carol")
            })
        );
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let config = SignalingConfig {
            url: "http://localhost:4000/signal".into(),
            ..SignalingConfig::default()
        };
        assert!(WsSignaling::new(&config, "call", PeerId::from("alice")).is_err());
        assert!(WsSignaling::new(&SignalingConfig::default(), "call", PeerId::from("alice")).is_ok());
    }

    #[tokio::test]
    async fn frame_that_failed_to_write_goes_out_first() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut outbox = Outbox::new(rx);
        let first = Frame::OfferRequest {
            peer_id: PeerId::from("bob"),
        };
        tx.send(first.clone()).unwrap();
        tx.send(Frame::Heartbeat).unwrap();

        let lost = outbox.next().await.unwrap();
        assert_eq!(lost, first);
        outbox.retry(lost);

        assert_eq!(outbox.next().await, Some(first));
        assert_eq!(outbox.next().await, Some(Frame::Heartbeat));
        drop(tx);
        assert_eq!(outbox.next().await, None);
    }

    #[tokio::test]
    async fn joins_and_relays_through_a_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let join = ws.next().await.unwrap().unwrap();
            let join: Frame = serde_json::from_str(join.to_text().unwrap()).unwrap();
            assert_eq!(
                join,
                Frame::Join {
                    call_id: "call-1".into(),
                    peer_id: PeerId::from("alice")
                }
            );

            let announce = Frame::PeerJoined {
                peer_id: PeerId::from("bob"),
            };
            ws.send(announce.to_message().unwrap()).await.unwrap();

            loop {
                let message = ws.next().await.unwrap().unwrap();
                if let Ok(Frame::Signal(signal)) =
                    serde_json::from_str::<Frame>(message.to_text().unwrap())
                {
                    return signal;
                }
            }
        });

        let config = SignalingConfig {
            url: format!("ws://{addr}"),
            ..SignalingConfig::default()
        };
        let (transport, mut events, task) = WsSignaling::new(&config, "call-1", PeerId::from("alice"))
            .unwrap()
            .connect();

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::PeerJoined {
                peer_id: PeerId::from("bob")
            }
        );

        let offer = SignalingMessage::offer(
            &PeerId::from("alice"),
            &PeerId::from("bob"),
            &SessionDescription::offer("v=0"),
        )
        .unwrap();
        transport.send(offer).unwrap();

        let relayed = server.await.unwrap();
        assert_eq!(relayed.kind, SignalKind::Offer);
        assert_eq!(relayed.to_peer, PeerId::from("bob"));
        task.abort();
    }
}
