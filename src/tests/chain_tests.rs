// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Chain integrity and replay-protection properties.

use super::*;
use crate::error::ValidationError;
use crate::state::LedgerState;

#[test]
fn test_chain_integrity_invariant() {
    let kp = keypair(10);
    let mut chain = Chain::new();

    for i in 0..5 {
        let p = PipelineId::new();
        commit_block(&mut chain, vec![create_event(p, &format!("p{}", i), &kp)], &kp);
    }

    let blocks = chain.blocks();
    for i in 1..blocks.len() {
        assert_eq!(blocks[i].prev_hash, blocks[i - 1].block_hash);
        assert_eq!(blocks[i].height, blocks[i - 1].height + 1);
    }
}

#[test]
fn test_no_two_blocks_share_a_height() {
    let kp = keypair(11);
    let mut chain = Chain::new();
    commit_block(&mut chain, vec![create_event(PipelineId::new(), "a", &kp)], &kp);

    // A second block at the same height cannot commit.
    let competing = Block::seal(
        1,
        chain.get(0).unwrap().block_hash,
        vec![create_event(PipelineId::new(), "b", &kp)],
        &kp,
    );
    let result = chain.commit(competing, &known_nodes(&[&kp]));
    assert_eq!(
        result,
        Err(ValidationError::HeightMismatch { head: 1, found: 1 })
    );
}

#[test]
fn test_idempotent_replay_rejection() {
    let kp = keypair(12);
    let mut chain = Chain::new();

    let p = PipelineId::new();
    let event = create_event(p, "pipeline", &kp);
    commit_block(&mut chain, vec![event.clone()], &kp);

    let (state_before, _) = LedgerState::replay(chain.blocks());

    // Re-submitting the committed event id must fail validation...
    let replayed = Block::seal(2, chain.head().block_hash, vec![event.clone()], &kp);
    assert_eq!(
        chain.commit(replayed, &known_nodes(&[&kp])),
        Err(ValidationError::DuplicateEvent(event.event_id))
    );

    // ...and leave every pipeline view untouched.
    let (state_after, _) = LedgerState::replay(chain.blocks());
    assert_eq!(state_before.state_hash(), state_after.state_hash());
}

#[test]
fn test_from_blocks_roundtrip() {
    let kp = keypair(13);
    let mut chain = Chain::new();
    for i in 0..3 {
        commit_block(
            &mut chain,
            vec![create_event(PipelineId::new(), &format!("p{}", i), &kp)],
            &kp,
        );
    }

    let reloaded = Chain::from_blocks(chain.blocks().to_vec()).unwrap();
    assert_eq!(reloaded.height(), chain.height());
    assert_eq!(reloaded.head().block_hash, chain.head().block_hash);
}

#[test]
fn test_from_blocks_rejects_broken_linkage() {
    let kp = keypair(14);
    let mut chain = Chain::new();
    for i in 0..3 {
        commit_block(
            &mut chain,
            vec![create_event(PipelineId::new(), &format!("p{}", i), &kp)],
            &kp,
        );
    }

    let mut blocks = chain.blocks().to_vec();
    blocks.remove(2); // gap in the middle

    assert!(Chain::from_blocks(blocks).is_err());
}

#[test]
fn test_truncate_returns_abandoned_blocks_and_frees_events() {
    let kp = keypair(15);
    let mut chain = Chain::new();

    let p = PipelineId::new();
    let event = create_event(p, "pipeline", &kp);
    commit_block(&mut chain, vec![event.clone()], &kp);
    commit_block(
        &mut chain,
        vec![stage_event(p, "build", StageStatus::Running, &kp)],
        &kp,
    );

    let removed = chain.truncate_to(0);
    assert_eq!(removed.len(), 2);
    assert_eq!(removed[0].height, 1);
    assert_eq!(chain.height(), 0);

    // The event ids left the committed set, so the same events can land
    // again on a replacement branch.
    assert!(!chain.contains_event(&event.event_id));
    let again = Block::seal(1, chain.head().block_hash, vec![event], &kp);
    assert!(chain.commit(again, &known_nodes(&[&kp])).is_ok());
}

#[test]
fn test_tampered_event_payload_never_reaches_a_block() {
    let kp = keypair(16);
    let mut event = create_event(PipelineId::new(), "pipeline", &kp);
    event.payload.push(0x00);

    // The event log refuses tampered events at the door; this is the
    // kernel-side half of that contract.
    assert!(event.verify_signature().is_err());
}
