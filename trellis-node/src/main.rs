//! `trellisd` — the Trellis overlay daemon.
//!
//! Topology and addressing come from the command line for now; every daemon
//! in a deployment must be started with identical topology arguments or the
//! configuration hash check will refuse to pair the links. Keys are derived
//! from a shared cluster seed (suitable for lab deployments only; a real
//! deployment loads per-node keys from disk).

mod daemon;
mod timers;

use clap::Parser;
use daemon::{Daemon, DaemonConfig};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use trellis_proto::config::{LinkConfig, PrioConfig, RelConfig};
use trellis_proto::crypto::{NodeIdentity, NodeVerifier};
use trellis_proto::ids::NodeId;

#[derive(Parser, Debug)]
#[command(name = "trellisd", about = "Trellis overlay messaging daemon")]
struct Args {
    /// This daemon's logical node id (1-based).
    #[arg(long)]
    id: u16,

    /// Total number of nodes in the configuration.
    #[arg(long)]
    nodes: u16,

    /// UDP address to bind.
    #[arg(long)]
    bind: SocketAddr,

    /// Neighbor addresses, `id=host:port`, repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Topology edges, `a:b:cost`, repeatable. Must be identical on every
    /// daemon.
    #[arg(long = "edge")]
    edges: Vec<String>,

    /// Shared cluster key seed (hex). All daemons derive node keys from it.
    #[arg(long, default_value = "746c6c73")]
    cluster_seed: String,

    /// Disable link crypto (testing only).
    #[arg(long)]
    no_crypto: bool,
}

fn parse_peer(s: &str) -> Result<(NodeId, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("bad peer spec {s:?}, expected id=host:port"))?;
    let id: u16 = id.parse().map_err(|_| format!("bad peer id in {s:?}"))?;
    let addr: SocketAddr = addr.parse().map_err(|_| format!("bad address in {s:?}"))?;
    Ok((NodeId(id), addr))
}

fn parse_edge(s: &str) -> Result<(NodeId, NodeId, i16), String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(format!("bad edge spec {s:?}, expected a:b:cost"));
    }
    let a: u16 = parts[0].parse().map_err(|_| format!("bad node in {s:?}"))?;
    let b: u16 = parts[1].parse().map_err(|_| format!("bad node in {s:?}"))?;
    let cost: i16 = parts[2].parse().map_err(|_| format!("bad cost in {s:?}"))?;
    Ok((NodeId(a), NodeId(b), cost))
}

/// Deterministic per-node signing seed from the cluster seed.
fn node_seed(cluster_seed: &[u8], id: u16) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"trellis node key v1");
    hasher.update(cluster_seed);
    hasher.update(id.to_be_bytes());
    hasher.finalize().into()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let cluster_seed = match hex_decode(&args.cluster_seed) {
        Some(seed) => seed,
        None => {
            eprintln!("--cluster-seed must be hex");
            std::process::exit(2);
        }
    };

    let mut peers = HashMap::new();
    for spec in &args.peers {
        match parse_peer(spec) {
            Ok((id, addr)) => {
                peers.insert(id, addr);
            }
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(2);
            }
        }
    }
    let mut edges = Vec::new();
    for spec in &args.edges {
        match parse_edge(spec) {
            Ok(edge) => edges.push(edge),
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(2);
            }
        }
    }

    let identity = NodeIdentity::from_seed(NodeId(args.id), &node_seed(&cluster_seed, args.id));
    let mut verifier = NodeVerifier::new(args.nodes);
    for id in 1..=args.nodes {
        let node = NodeIdentity::from_seed(NodeId(id), &node_seed(&cluster_seed, id));
        verifier.insert(NodeId(id), node.verifying_key());
    }

    let mut link = LinkConfig::default();
    if args.no_crypto {
        link.crypto = false;
        link.encrypt = false;
    }

    let config = DaemonConfig {
        my_id: NodeId(args.id),
        node_count: args.nodes,
        bind: args.bind,
        peers,
        edges,
        link,
        prio: PrioConfig::default(),
        rel: RelConfig::default(),
        identity,
        verifier,
    };

    let mut daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(err) => {
            eprintln!("failed to start: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = daemon.run() {
        eprintln!("daemon exited: {err}");
        std::process::exit(1);
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
