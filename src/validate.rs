// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Block validation.
//!
//! Pure checks of a candidate block's internal integrity and its linkage
//! to the chain it claims to extend. Checks run in a fixed order and the
//! first failure names itself; the caller never partially commits a block
//! that fails any check.

use crate::block::Block;
use crate::chain::Chain;
use crate::crypto::NodeId;
use crate::error::ValidationError;
use rustc_hash::FxHashSet;

/// Validate `candidate` against the current `chain`.
///
/// Check order:
/// (a) height extends the head by exactly one
/// (b) `prev_hash` links to the head block hash
/// (c) the merkle root matches the carried events
/// (d) the block hash matches the header
/// (e) the proposer is known and signed the header
/// (f) every event signature verifies independently
/// (g) no event id repeats, in-block or against the committed chain
pub fn validate_block(
    candidate: &Block,
    chain: &Chain,
    known_nodes: &FxHashSet<NodeId>,
) -> Result<(), ValidationError> {
    let head = chain.head();

    // (a) height continuity
    if candidate.height != head.height + 1 {
        return Err(ValidationError::HeightMismatch {
            head: head.height,
            found: candidate.height,
        });
    }

    // (b) hash linkage
    if candidate.prev_hash != head.block_hash {
        return Err(ValidationError::PrevHashMismatch);
    }

    // (c) merkle root over the carried events
    if candidate.recompute_merkle_root() != candidate.merkle_root {
        return Err(ValidationError::MerkleRootMismatch);
    }

    // (d) block hash over the header
    if candidate.recompute_hash() != candidate.block_hash {
        return Err(ValidationError::BlockHashMismatch);
    }

    // (e) proposer signature over the header
    if !known_nodes.contains(&candidate.proposer) {
        return Err(ValidationError::UnknownProposer(candidate.proposer));
    }
    if candidate.verify_proposer_signature().is_err() {
        return Err(ValidationError::BadProposerSignature);
    }

    // (f) every event signature
    for event in &candidate.events {
        if event.verify_signature().is_err() {
            return Err(ValidationError::BadEventSignature(event.event_id));
        }
    }

    // (g) duplicate event ids, in-block and against the chain
    let mut seen = FxHashSet::default();
    for event in &candidate.events {
        if chain.contains_event(&event.event_id) || !seen.insert(event.event_id) {
            return Err(ValidationError::DuplicateEvent(event.event_id));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;
    use crate::event::{CreatePayload, EventPayload, PipelineEvent};
    use crate::types::id::PipelineId;
    use crate::types::time::HybridTimestamp;

    fn keypair() -> NodeKeypair {
        NodeKeypair::from_seed([5u8; 32])
    }

    fn known(kp: &NodeKeypair) -> FxHashSet<NodeId> {
        let mut set = FxHashSet::default();
        set.insert(kp.node_id());
        set
    }

    fn event(kp: &NodeKeypair, name: &str) -> PipelineEvent {
        let payload = EventPayload::Create(CreatePayload {
            name: name.to_string(),
            stages: vec![],
        });
        PipelineEvent::build(PipelineId::new(), &payload, HybridTimestamp::new(10, 0), kp).unwrap()
    }

    #[test]
    fn test_valid_block_passes() {
        let kp = keypair();
        let chain = Chain::new();
        let block = Block::seal(1, chain.head().block_hash, vec![event(&kp, "a")], &kp);

        assert!(validate_block(&block, &chain, &known(&kp)).is_ok());
    }

    #[test]
    fn test_wrong_height_rejected() {
        let kp = keypair();
        let chain = Chain::new();
        let block = Block::seal(3, chain.head().block_hash, vec![event(&kp, "a")], &kp);

        assert_eq!(
            validate_block(&block, &chain, &known(&kp)),
            Err(ValidationError::HeightMismatch { head: 0, found: 3 })
        );
    }

    #[test]
    fn test_wrong_prev_hash_rejected() {
        let kp = keypair();
        let chain = Chain::new();
        let block = Block::seal(1, crate::types::hash::BlockHash([9u8; 32]), vec![], &kp);

        assert_eq!(
            validate_block(&block, &chain, &known(&kp)),
            Err(ValidationError::PrevHashMismatch)
        );
    }

    #[test]
    fn test_tampered_events_rejected() {
        let kp = keypair();
        let chain = Chain::new();
        let mut block = Block::seal(1, chain.head().block_hash, vec![event(&kp, "a")], &kp);

        // Swap in an event that was never merkle-committed.
        block.events[0] = event(&kp, "b");

        assert_eq!(
            validate_block(&block, &chain, &known(&kp)),
            Err(ValidationError::MerkleRootMismatch)
        );
    }

    #[test]
    fn test_unknown_proposer_rejected() {
        let kp = keypair();
        let stranger = NodeKeypair::from_seed([42u8; 32]);
        let chain = Chain::new();
        let block = Block::seal(1, chain.head().block_hash, vec![], &stranger);

        assert_eq!(
            validate_block(&block, &chain, &known(&kp)),
            Err(ValidationError::UnknownProposer(stranger.node_id()))
        );
    }

    #[test]
    fn test_bad_event_signature_rejected() {
        let kp = keypair();
        let chain = Chain::new();

        let mut ev = event(&kp, "a");
        ev.payload.push(0xFF); // break the signature
        let id = ev.event_id;

        // Re-seal so merkle/hash cover the tampered event; only the event
        // signature check can catch it now.
        let block = Block::seal(1, chain.head().block_hash, vec![ev], &kp);

        assert_eq!(
            validate_block(&block, &chain, &known(&kp)),
            Err(ValidationError::BadEventSignature(id))
        );
    }

    #[test]
    fn test_duplicate_event_in_block_rejected() {
        let kp = keypair();
        let chain = Chain::new();

        let ev = event(&kp, "a");
        let id = ev.event_id;
        let block = Block::seal(1, chain.head().block_hash, vec![ev.clone(), ev], &kp);

        assert_eq!(
            validate_block(&block, &chain, &known(&kp)),
            Err(ValidationError::DuplicateEvent(id))
        );
    }

    #[test]
    fn test_duplicate_event_across_blocks_rejected() {
        let kp = keypair();
        let mut chain = Chain::new();

        let ev = event(&kp, "a");
        let id = ev.event_id;

        let first = Block::seal(1, chain.head().block_hash, vec![ev.clone()], &kp);
        chain.commit(first, &known(&kp)).unwrap();

        let second = Block::seal(2, chain.head().block_hash, vec![ev], &kp);
        assert_eq!(
            validate_block(&second, &chain, &known(&kp)),
            Err(ValidationError::DuplicateEvent(id))
        );
    }
}
