//! # mesh-sim
//!
//! Runs several call participants in one process: each gets its own call
//! session, a loopback capture device, loopback peer connections, and a seat on
//! a shared [`MemoryBus`]. Used by the `mesh-sim` binary and the end-to-end
//! tests.

use mesh_call::loopback::{LoopbackDevice, LoopbackNetwork};
use mesh_call::{CallDeps, CallHandle, CallSnapshot, ConnectionState};
use mesh_common::config::MeshConfig;
use mesh_common::{MeshError, MeshResult, PeerId};
use mesh_transport::MemoryBus;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often [`Simulation::wait_until`] re-checks its condition.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Participant {
    pub id: PeerId,
    pub call: CallHandle,
    pub device: Arc<LoopbackDevice>,
    forward: JoinHandle<()>,
}

pub struct Simulation {
    config: MeshConfig,
    bus: MemoryBus,
    network: LoopbackNetwork,
    participants: BTreeMap<PeerId, Participant>,
}

impl Simulation {
    pub fn new(config: MeshConfig, bus: MemoryBus, network: LoopbackNetwork) -> Self {
        Self {
            config,
            bus,
            network,
            participants: BTreeMap::new(),
        }
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    /// Bring `id` into the call with a working camera and microphone.
    pub fn join(&mut self, id: &str) -> &Participant {
        self.join_with_device(id, LoopbackDevice::new())
    }

    pub fn join_with_device(&mut self, id: &str, device: Arc<LoopbackDevice>) -> &Participant {
        let id = PeerId::from(id);
        if let Some(previous) = self.participants.remove(&id) {
            previous.stop();
        }

        let (endpoint, inbound) = self.bus.join(id.clone());
        let call = CallHandle::spawn(
            id.clone(),
            &self.config,
            CallDeps {
                capture: device.clone(),
                factory: self.network.factory(id.clone()),
                transport: endpoint,
            },
        );
        // The local join is queued before any peer event the bus delivers.
        call.join();
        let forward = call.forward(inbound);
        tracing::info!(peer = %id, "Participant joined simulation");

        self.participants.entry(id.clone()).or_insert(Participant {
            id,
            call,
            device,
            forward,
        })
    }

    /// Take `id` out of the call: local leave, then the bus tells the others.
    pub fn leave(&mut self, id: &str) -> bool {
        let id = PeerId::from(id);
        let Some(participant) = self.participants.remove(&id) else {
            return false;
        };
        participant.call.leave();
        self.bus.leave(&id);
        participant.stop();
        tracing::info!(peer = %id, "Participant left simulation");
        true
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.get(&PeerId::from(id))
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.participants.keys().cloned().collect()
    }

    pub async fn snapshots(&self) -> MeshResult<Vec<CallSnapshot>> {
        let mut snapshots = Vec::with_capacity(self.participants.len());
        for participant in self.participants.values() {
            snapshots.push(participant.call.snapshot().await?);
        }
        Ok(snapshots)
    }

    /// Poll snapshots until `done` holds or `timeout` elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, done: F) -> MeshResult<Vec<CallSnapshot>>
    where
        F: Fn(&[CallSnapshot]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshots = self.snapshots().await?;
            if done(&snapshots) {
                return Ok(snapshots);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MeshError::Internal(anyhow::anyhow!(
                    "simulation did not settle within {timeout:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop every participant.
    pub fn shutdown(&mut self) {
        let ids = self.ids();
        for id in ids {
            self.leave(id.as_str());
        }
    }
}

impl Participant {
    fn stop(self) {
        self.call.shutdown();
        self.forward.abort();
    }
}

/// State of the connection `from` holds towards `to`, if any.
pub fn edge_state(snapshots: &[CallSnapshot], from: &PeerId, to: &PeerId) -> Option<ConnectionState> {
    snapshots
        .iter()
        .find(|s| s.local == *from)?
        .peers
        .iter()
        .find(|p| p.peer_id == *to)?
        .connection
        .as_ref()
        .map(|c| c.state)
}

/// Every participant knows every other one and holds a connected edge to it.
pub fn fully_connected(snapshots: &[CallSnapshot]) -> bool {
    snapshots.iter().all(|s| {
        s.peers.len() + 1 == snapshots.len()
            && s.peers.iter().all(|p| {
                p.connection
                    .as_ref()
                    .is_some_and(|c| c.state == ConnectionState::Connected)
            })
    })
}

/// Distinct connected mesh edges, counting each pair once.
pub fn connected_edges(snapshots: &[CallSnapshot]) -> usize {
    snapshots
        .iter()
        .flat_map(|s| {
            s.peers.iter().filter_map(move |p| {
                let connected = p
                    .connection
                    .as_ref()
                    .is_some_and(|c| c.state == ConnectionState::Connected);
                (connected && s.local < p.peer_id).then_some(())
            })
        })
        .count()
}
