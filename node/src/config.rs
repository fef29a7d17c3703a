// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Node configuration.
//!
//! Everything the node needs to know about itself and its fleet is an
//! explicit field here, threaded through the coordinator and sync layer.
//! There is no ambient global node state.

use crate::errors::NodeError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One pre-provisioned peer: its identity (hex public key) and where to
/// dial it. Key distribution itself is out of scope; the fleet is assumed
/// provisioned before start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the record store and the identity seed.
    pub data_dir: PathBuf,
    /// Listen address for peer connections.
    pub bind_addr: SocketAddr,
    /// Provisioned peers.
    pub peers: Vec<PeerConfig>,
    /// Hex-encoded 32-byte identity seed. When absent, a seed is
    /// generated on first start and persisted under `data_dir`.
    pub identity_seed: Option<String>,

    /// Seal cadence; a block is also sealed early once the pending log
    /// reaches `seal_max_events`.
    pub seal_interval_ms: u64,
    pub seal_max_events: usize,

    /// Maximum depth the sync protocol will walk back looking for a
    /// common ancestor before reporting `ChainDivergenceTooDeep`.
    pub max_reorg_depth: u64,

    /// Per-operation peer I/O timeout.
    pub peer_timeout_ms: u64,
    /// Reconnect backoff, doubling from base to max.
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// A peer silent for longer than this is marked unreachable.
    pub peer_silence_timeout_ms: u64,

    /// Cadence of HeightAdvert messages on in-sync connections.
    pub advert_interval_ms: u64,
    /// Snapshot the materialized views every N blocks. 0 disables.
    pub snapshot_interval_blocks: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./forgeline-data"),
            bind_addr: "127.0.0.1:7340".parse().unwrap(),
            peers: Vec::new(),
            identity_seed: None,
            seal_interval_ms: 500,
            seal_max_events: 64,
            max_reorg_depth: 64,
            peer_timeout_ms: 5_000,
            retry_backoff_ms: 500,
            retry_backoff_max_ms: 30_000,
            peer_silence_timeout_ms: 60_000,
            advert_interval_ms: 2_000,
            snapshot_interval_blocks: 32,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| NodeError::Config(format!("read {:?}: {}", path.as_ref(), e)))?;
        serde_json::from_str(&raw).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn seal_interval(&self) -> Duration {
        Duration::from_millis(self.seal_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn peer_silence_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_silence_timeout_ms)
    }

    pub fn advert_interval(&self) -> Duration {
        Duration::from_millis(self.advert_interval_ms)
    }
}
