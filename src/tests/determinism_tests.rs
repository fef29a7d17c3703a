// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Replay determinism: the core correctness property of the whole design.

use super::*;
use crate::state::LedgerState;

#[test]
fn test_replay_is_deterministic_across_instances() {
    let kp = keypair(1);
    let mut chain = Chain::new();

    let p1 = PipelineId::new();
    let p2 = PipelineId::new();

    commit_block(&mut chain, vec![create_event(p1, "alpha", &kp)], &kp);
    commit_block(
        &mut chain,
        vec![
            create_event(p2, "beta", &kp),
            stage_event(p1, "build", StageStatus::Running, &kp),
        ],
        &kp,
    );
    commit_block(
        &mut chain,
        vec![stage_event(p1, "build", StageStatus::Succeeded, &kp)],
        &kp,
    );

    let (state_a, anomalies_a) = LedgerState::replay(chain.blocks());
    let (state_b, anomalies_b) = LedgerState::replay(chain.blocks());

    assert!(anomalies_a.is_empty());
    assert_eq!(anomalies_a, anomalies_b);
    assert_eq!(state_a, state_b);
    assert_eq!(state_a.state_hash(), state_b.state_hash());
}

#[test]
fn test_replay_is_byte_identical() {
    let kp = keypair(2);
    let mut chain = Chain::new();

    let p1 = PipelineId::new();
    commit_block(&mut chain, vec![create_event(p1, "gamma", &kp)], &kp);

    let (state_a, _) = LedgerState::replay(chain.blocks());
    let (state_b, _) = LedgerState::replay(chain.blocks());

    let config = bincode::config::standard();
    let bytes_a = bincode::serde::encode_to_vec(&state_a, config).unwrap();
    let bytes_b = bincode::serde::encode_to_vec(&state_b, config).unwrap();

    assert_eq!(bytes_a, bytes_b, "materialized views must encode identically");
}

#[test]
fn test_incremental_apply_matches_full_replay() {
    let kp = keypair(3);
    let mut chain = Chain::new();
    let mut incremental = LedgerState::new();

    let p1 = PipelineId::new();

    let b1 = commit_block(&mut chain, vec![create_event(p1, "delta", &kp)], &kp);
    incremental.apply_block(&b1);

    let b2 = commit_block(
        &mut chain,
        vec![stage_event(p1, "test", StageStatus::Failed, &kp)],
        &kp,
    );
    incremental.apply_block(&b2);

    let (replayed, _) = LedgerState::replay(chain.blocks());
    assert_eq!(incremental, replayed);
    assert_eq!(incremental.state_hash(), replayed.state_hash());
}

#[test]
fn test_list_order_is_stable() {
    let kp = keypair(4);
    let mut chain = Chain::new();

    // Insert in a jumbled order; iteration must come back sorted by id.
    let mut ids: Vec<PipelineId> = (0..5).map(|_| PipelineId::new()).collect();
    for (i, id) in ids.iter().enumerate() {
        commit_block(&mut chain, vec![create_event(*id, &format!("p{}", i), &kp)], &kp);
    }

    let (state, _) = LedgerState::replay(chain.blocks());
    let listed: Vec<PipelineId> = state.iter().map(|v| v.pipeline_id).collect();

    ids.sort();
    assert_eq!(listed, ids);
}
