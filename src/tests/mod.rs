// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Cross-module property tests.

mod chain_tests;
mod determinism_tests;

use crate::block::Block;
use crate::chain::Chain;
use crate::crypto::{NodeId, NodeKeypair};
use crate::event::{
    CreatePayload, EventPayload, PipelineEvent, StageStatus, StageUpdatePayload,
};
use crate::types::id::PipelineId;
use crate::types::time::HybridTimestamp;
use rustc_hash::FxHashSet;

pub fn keypair(seed: u8) -> NodeKeypair {
    NodeKeypair::from_seed([seed; 32])
}

pub fn known_nodes(keypairs: &[&NodeKeypair]) -> FxHashSet<NodeId> {
    keypairs.iter().map(|kp| kp.node_id()).collect()
}

pub fn create_event(pipeline: PipelineId, name: &str, kp: &NodeKeypair) -> PipelineEvent {
    let payload = EventPayload::Create(CreatePayload {
        name: name.to_string(),
        stages: vec!["build".to_string(), "test".to_string()],
    });
    PipelineEvent::build(pipeline, &payload, HybridTimestamp::new(1_000, 0), kp).unwrap()
}

pub fn stage_event(
    pipeline: PipelineId,
    stage: &str,
    status: StageStatus,
    kp: &NodeKeypair,
) -> PipelineEvent {
    let payload = EventPayload::StageUpdate(StageUpdatePayload {
        stage: stage.to_string(),
        status,
    });
    PipelineEvent::build(pipeline, &payload, HybridTimestamp::new(1_001, 1), kp).unwrap()
}

/// Seal and commit one block of `events` on top of `chain`.
pub fn commit_block(chain: &mut Chain, events: Vec<PipelineEvent>, kp: &NodeKeypair) -> Block {
    let block = Block::seal(chain.height() + 1, chain.head().block_hash, events, kp);
    chain
        .commit(block.clone(), &known_nodes(&[kp]))
        .expect("test block must commit");
    block
}
