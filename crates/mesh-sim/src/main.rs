//! # mesh-sim
//!
//! Runs a simulated full-mesh call in one process and reports how the mesh
//! settled. Useful to watch the negotiation logs end to end:
//!
//! ```text
//! RUST_LOG=mesh=debug mesh-sim --peers 4 --leave peer-02 --duplicate
//! ```

use clap::Parser;
use mesh_call::loopback::LoopbackNetwork;
use mesh_sim::{Simulation, connected_edges, fully_connected};
use mesh_transport::MemoryBus;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "mesh-sim", version, about = "Run a simulated full-mesh call")]
struct Cli {
    /// Number of participants.
    #[arg(short, long, default_value_t = 3, env = "MESH_SIM_PEERS")]
    peers: usize,

    /// Participant to take out of the call once the mesh is up.
    #[arg(long)]
    leave: Option<String>,

    /// Deliver every signaling message twice.
    #[arg(long)]
    duplicate: bool,

    /// Delay applied to every peer connection operation and event.
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// How long to wait for the mesh to settle.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Print the final snapshots as JSON.
    #[arg(long)]
    json: bool,
}

fn peer_name(index: usize) -> String {
    format!("peer-{index:02}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = mesh_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting mesh-sim v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        peers = cli.peers,
        duplicate = cli.duplicate,
        latency_ms = cli.latency_ms,
        negotiation_timeout_ms = config.call.negotiation_timeout_ms,
        "Simulation parameters"
    );

    let bus = if cli.duplicate {
        MemoryBus::with_duplicates()
    } else {
        MemoryBus::new()
    };
    let network = LoopbackNetwork::with_latency(Duration::from_millis(cli.latency_ms));
    let mut sim = Simulation::new(config.clone(), bus, network);
    let timeout = Duration::from_secs(cli.timeout_secs);

    for index in 0..cli.peers {
        sim.join(&peer_name(index));
    }

    let snapshots = sim.wait_until(timeout, fully_connected).await?;
    tracing::info!(
        edges = connected_edges(&snapshots),
        "Mesh established across {} participants",
        snapshots.len()
    );

    if let Some(leaving) = &cli.leave {
        if !sim.leave(leaving) {
            anyhow::bail!("no participant named {leaving}");
        }
        let snapshots = sim.wait_until(timeout, fully_connected).await?;
        tracing::info!(
            peer = %leaving,
            edges = connected_edges(&snapshots),
            "Mesh settled after departure"
        );
    }

    let snapshots = sim.snapshots().await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    } else {
        for snapshot in &snapshots {
            let states: Vec<String> = snapshot
                .peers
                .iter()
                .map(|p| {
                    let state = p
                        .connection
                        .as_ref()
                        .map_or_else(|| "none".to_owned(), |c| c.state.to_string());
                    format!("{}={}", p.peer_id, state)
                })
                .collect();
            println!("{} [{:?}] {}", snapshot.local, snapshot.media, states.join(" "));
        }
    }

    sim.shutdown();
    tracing::info!("Simulation finished");
    Ok(())
}
