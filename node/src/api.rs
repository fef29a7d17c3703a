// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! API-facing surface.
//!
//! The thin facade an HTTP layer (out of scope here) consumes. All reads
//! come from consistent chain-store snapshots; the only write is the
//! local event-log append.

use crate::coordinator::Coordinator;
use crate::errors::RejectReason;
use crate::event_log::EventRef;
use crate::peers::PeerInfo;
use forgeline_kernel::crypto::NodeId;
use forgeline_kernel::event::{EventPayload, PipelineEvent};
use forgeline_kernel::state::PipelineView;
use forgeline_kernel::types::hash::BlockHash;
use forgeline_kernel::types::id::PipelineId;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone, Debug, Serialize)]
pub struct ChainStatus {
    pub height: u64,
    pub head_hash: BlockHash,
    pub peer_count: usize,
}

#[derive(Clone)]
pub struct NodeHandle {
    co: Arc<Coordinator>,
}

impl NodeHandle {
    pub(crate) fn new(co: Arc<Coordinator>) -> Self {
        Self { co }
    }

    pub fn node_id(&self) -> NodeId {
        self.co.node_id()
    }

    /// Submit a pre-signed event from any provisioned node.
    pub async fn submit_event(&self, event: PipelineEvent) -> Result<EventRef, RejectReason> {
        self.co.submit_event(event).await
    }

    /// Build, sign, and submit an event under this node's identity.
    pub async fn submit(
        &self,
        pipeline_id: PipelineId,
        payload: &EventPayload,
    ) -> Result<EventRef, RejectReason> {
        self.co.submit_payload(pipeline_id, payload).await
    }

    pub async fn get_pipeline(&self, id: &PipelineId) -> Option<PipelineView> {
        self.co.chain.get_pipeline(id).await
    }

    /// All pipelines, ascending by pipeline id.
    pub async fn list_pipelines(&self) -> Vec<PipelineView> {
        self.co.chain.list_pipelines().await
    }

    pub async fn get_chain_status(&self) -> ChainStatus {
        let (height, head_hash) = self.co.chain.status().await;
        ChainStatus {
            height,
            head_hash,
            peer_count: self.co.peers.reachable_count(),
        }
    }

    /// Canonical hash of the materialized views; equal hashes on two
    /// nodes mean byte-identical pipeline state.
    pub async fn state_hash(&self) -> [u8; 32] {
        self.co.chain.state_hash().await
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.co.peers.snapshot()
    }

    /// Seal whatever is pending right now instead of waiting for the
    /// timer. Used by operators (and tests) to flush.
    pub async fn seal_now(&self) -> Result<Option<u64>, crate::errors::NodeError> {
        Ok(self.co.seal_once().await?.map(|o| o.height))
    }

    /// Provision a peer at runtime and start dialing it. A no-op when the
    /// peer is already known, so a dialer never runs twice.
    pub fn connect_peer(&self, node_id: NodeId, addr: String) {
        if self.co.add_peer(node_id, addr.clone()) {
            let co = self.co.clone();
            tokio::spawn(crate::sync::session::run_dialer(co, node_id, addr));
        }
    }
}
