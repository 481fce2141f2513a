//! # mesh-transport
//!
//! Signaling transports for mesh calls. Both deliver the same
//! [`TransportEvent`](mesh_common::event::TransportEvent) stream to a call and
//! implement [`SignalingTransport`](mesh_call::SignalingTransport) for the
//! outbound direction:
//! - [`memory::MemoryBus`]: in-process relay, used by the simulator and tests
//! - [`ws::WsSignaling`]: WebSocket client for a signaling relay server

pub mod memory;
pub mod ws;

pub use memory::{BusEndpoint, MemoryBus};
pub use ws::{Frame, WsSignaling, WsTransport};
