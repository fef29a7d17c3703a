// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Node assembly and lifecycle.
//!
//! Wires the storage collaborator, chain store recovery, event log,
//! peer registry, coordinator, listener, dialers, and the sealing loop
//! into one running node.

use crate::api::NodeHandle;
use crate::chain_store::ChainStore;
use crate::config::NodeConfig;
use crate::coordinator::Coordinator;
use crate::errors::NodeError;
use crate::event_log::EventLog;
use crate::peers::PeerRegistry;
use crate::storage::FileStore;
use crate::sync::listener::run_listener;
use crate::sync::session::run_dialer;
use forgeline_kernel::crypto::{NodeId, NodeKeypair};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct Node {
    handle: NodeHandle,
    /// Actual bound address (relevant when the config asked for port 0).
    pub local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub async fn start(cfg: NodeConfig) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&cfg.data_dir)?;

        let keypair = load_identity(&cfg)?;
        let node_id = keypair.node_id();
        tracing::info!(%node_id, "starting node");

        let store = Arc::new(FileStore::open(cfg.data_dir.join("ledger.db"))?);
        let chain = ChainStore::open(store.clone(), cfg.snapshot_interval_blocks)?;
        let event_log = EventLog::open(store, cfg.seal_max_events)?;

        let peers = PeerRegistry::new(parse_peers(&cfg)?, cfg.peer_silence_timeout());

        let listener = TcpListener::bind(cfg.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening for peers");

        let co = Arc::new(Coordinator::new(
            cfg.clone(),
            keypair,
            event_log,
            chain,
            peers,
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_listener(co.clone(), listener)));
        for peer in &cfg.peers {
            let peer_id = NodeId::from_hex(&peer.node_id)
                .ok_or_else(|| NodeError::Config(format!("bad peer node_id {}", peer.node_id)))?;
            tasks.push(tokio::spawn(run_dialer(
                co.clone(),
                peer_id,
                peer.addr.clone(),
            )));
        }
        tasks.push(tokio::spawn(co.clone().run_seal_loop()));

        Ok(Self {
            handle: NodeHandle::new(co),
            local_addr,
            tasks,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("node stopped");
    }
}

/// Load the identity seed from config or disk, generating and persisting
/// one on first start.
fn load_identity(cfg: &NodeConfig) -> Result<NodeKeypair, NodeError> {
    if let Some(hex) = &cfg.identity_seed {
        let seed = parse_seed(hex)
            .ok_or_else(|| NodeError::Identity("identity_seed must be 64 hex chars".into()))?;
        return Ok(NodeKeypair::from_seed(seed));
    }

    let path = cfg.data_dir.join("node_key");
    if path.exists() {
        let raw = std::fs::read(&path).map_err(|e| NodeError::Identity(e.to_string()))?;
        let seed: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::Identity(format!("{:?} is not a 32-byte seed", path)))?;
        Ok(NodeKeypair::from_seed(seed))
    } else {
        let keypair = NodeKeypair::generate();
        std::fs::write(&path, keypair.to_seed()).map_err(|e| NodeError::Identity(e.to_string()))?;
        tracing::info!(?path, "generated node identity");
        Ok(keypair)
    }
}

fn parse_seed(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

fn parse_peers(cfg: &NodeConfig) -> Result<Vec<(NodeId, String)>, NodeError> {
    cfg.peers
        .iter()
        .map(|p| {
            NodeId::from_hex(&p.node_id)
                .map(|id| (id, p.addr.clone()))
                .ok_or_else(|| NodeError::Config(format!("bad peer node_id {}", p.node_id)))
        })
        .collect()
}
