// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Provisioned peer registry.
//!
//! Peers are created from config (or added at runtime by an operator),
//! refreshed on every sync exchange, and marked unreachable after a
//! configurable silence window. Nothing is ever deleted: an unreachable
//! peer keeps its history and recovers on the next contact.
//!
//! Validation failures lower a peer's standing without banning it, so a
//! peer that misbehaved through a transient bug or clock skew can come
//! back on its own.

use forgeline_kernel::crypto::NodeId;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub addr: String,
    pub last_known_height: u64,
    pub last_contact: Option<Instant>,
    pub validation_failures: u32,
    pub reachable: bool,
}

pub struct PeerRegistry {
    inner: Mutex<FxHashMap<NodeId, PeerInfo>>,
    silence_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(peers: Vec<(NodeId, String)>, silence_timeout: Duration) -> Self {
        let map = peers
            .into_iter()
            .map(|(node_id, addr)| {
                (
                    node_id,
                    PeerInfo {
                        node_id,
                        addr,
                        last_known_height: 0,
                        last_contact: None,
                        validation_failures: 0,
                        reachable: false,
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(map),
            silence_timeout,
        }
    }

    /// Register a peer discovered after startup. A no-op if the id is
    /// already known.
    pub fn add_peer(&self, node_id: NodeId, addr: String) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&node_id) {
            return false;
        }
        inner.insert(
            node_id,
            PeerInfo {
                node_id,
                addr,
                last_known_height: 0,
                last_contact: None,
                validation_failures: 0,
                reachable: false,
            },
        );
        true
    }

    pub fn is_known(&self, node_id: &NodeId) -> bool {
        self.inner.lock().unwrap().contains_key(node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner.lock().unwrap().keys().copied().collect()
    }

    /// Record a successful exchange with `node_id` at `height`.
    pub fn record_contact(&self, node_id: &NodeId, height: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.get_mut(node_id) {
            peer.last_known_height = height;
            peer.last_contact = Some(Instant::now());
            if !peer.reachable {
                tracing::info!(peer = %node_id, height, "peer reachable");
            }
            peer.reachable = true;
        }
    }

    /// Record an inbound block that failed validation. Returns the new
    /// failure count.
    pub fn record_validation_failure(&self, node_id: &NodeId) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(node_id) {
            Some(peer) => {
                peer.validation_failures += 1;
                peer.validation_failures
            }
            None => 0,
        }
    }

    pub fn validation_failures(&self, node_id: &NodeId) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .get(node_id)
            .map(|p| p.validation_failures)
            .unwrap_or(0)
    }

    /// Flip peers silent past the timeout to unreachable. History stays.
    pub fn sweep_silent(&self) {
        let mut inner = self.inner.lock().unwrap();
        for peer in inner.values_mut() {
            if peer.reachable {
                let silent = peer
                    .last_contact
                    .map(|t| t.elapsed() > self.silence_timeout)
                    .unwrap_or(true);
                if silent {
                    tracing::warn!(peer = %peer.node_id, "peer silent past timeout, marking unreachable");
                    peer.reachable = false;
                }
            }
        }
    }

    pub fn reachable_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.reachable)
            .count()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.lock().unwrap().values().cloned().collect();
        peers.sort_by_key(|p| p.node_id);
        peers
    }
}
