// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The canonical chain and the fork-choice rule.
//!
//! A node holds exactly one `Chain` at a time: a totally ordered sequence
//! of committed blocks starting at genesis, with lookup indexes by block
//! hash and by committed event id.
//!
//! # Invariants
//! - Heights are contiguous from 0
//! - `blocks[i].prev_hash == blocks[i-1].block_hash` for every i > 0
//! - No two committed blocks share a height
//! - No two committed events share an `event_id`
//!
//! Competing chains are resolved, never merged: the fork-choice rule in
//! [`candidate_branch_wins`] picks the same winner on every honest node.

use crate::block::Block;
use crate::crypto::NodeId;
use crate::error::ValidationError;
use crate::types::hash::BlockHash;
use crate::types::id::EventId;
use crate::validate::validate_block;
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Clone, Debug)]
pub struct Chain {
    blocks: Vec<Block>,
    by_hash: FxHashMap<BlockHash, u64>,
    event_ids: FxHashSet<EventId>,
}

impl Chain {
    /// A fresh chain holding only the genesis block.
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let mut by_hash = FxHashMap::default();
        by_hash.insert(genesis.block_hash, 0);
        Self {
            blocks: vec![genesis],
            by_hash,
            event_ids: FxHashSet::default(),
        }
    }

    /// Rebuild a chain from persisted blocks, re-checking every structural
    /// invariant (linkage, hashes, merkle roots, duplicate events).
    ///
    /// Signatures are not re-verified here; they were verified before the
    /// blocks were ever persisted, and recovery must also accept history
    /// from nodes whose keys have since been rotated out of the known set.
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self, ValidationError> {
        let mut chain = Self::new();

        let mut iter = blocks.into_iter();
        match iter.next() {
            Some(genesis) if genesis == *chain.head() => {}
            _ => return Err(ValidationError::PrevHashMismatch),
        }

        for block in iter {
            chain.check_structure(&block)?;
            chain.append_unchecked(block);
        }

        Ok(chain)
    }

    pub fn head(&self) -> &Block {
        // A chain always holds at least the genesis block.
        self.blocks.last().unwrap()
    }

    pub fn height(&self) -> u64 {
        self.head().height
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get(&self, height: u64) -> Option<&Block> {
        self.blocks.get(height as usize)
    }

    pub fn get_by_hash(&self, hash: &BlockHash) -> Option<&Block> {
        self.by_hash.get(hash).and_then(|h| self.get(*h))
    }

    pub fn contains_event(&self, id: &EventId) -> bool {
        self.event_ids.contains(id)
    }

    /// Commit a block: full validation, then append. All-or-nothing.
    pub fn commit(
        &mut self,
        block: Block,
        known_nodes: &FxHashSet<NodeId>,
    ) -> Result<(), ValidationError> {
        validate_block(&block, self, known_nodes)?;
        self.append_unchecked(block);
        Ok(())
    }

    /// Append a block the caller has already run through
    /// [`validate_block`] against this exact chain state. Exists so a
    /// commit path can persist the block between validation and append
    /// without validating twice.
    pub fn append_validated(&mut self, block: Block) {
        debug_assert_eq!(block.height, self.height() + 1);
        debug_assert_eq!(block.prev_hash, self.head().block_hash);
        self.append_unchecked(block);
    }

    /// Drop all blocks above `height` and return them in ascending order.
    /// Their events leave the committed set, so a replacement branch can
    /// legitimately re-commit them.
    pub fn truncate_to(&mut self, height: u64) -> Vec<Block> {
        let keep = (height + 1) as usize;
        if keep >= self.blocks.len() {
            return Vec::new();
        }

        let removed: Vec<Block> = self.blocks.split_off(keep);
        for block in &removed {
            self.by_hash.remove(&block.block_hash);
            for event in &block.events {
                self.event_ids.remove(&event.event_id);
            }
        }
        removed
    }

    /// Structural subset of validation used when reloading persisted
    /// blocks: checks (a)-(d) and (g), skipping signatures.
    fn check_structure(&self, block: &Block) -> Result<(), ValidationError> {
        let head = self.head();
        if block.height != head.height + 1 {
            return Err(ValidationError::HeightMismatch {
                head: head.height,
                found: block.height,
            });
        }
        if block.prev_hash != head.block_hash {
            return Err(ValidationError::PrevHashMismatch);
        }
        if block.recompute_merkle_root() != block.merkle_root {
            return Err(ValidationError::MerkleRootMismatch);
        }
        if block.recompute_hash() != block.block_hash {
            return Err(ValidationError::BlockHashMismatch);
        }
        let mut seen = FxHashSet::default();
        for event in &block.events {
            if self.event_ids.contains(&event.event_id) || !seen.insert(event.event_id) {
                return Err(ValidationError::DuplicateEvent(event.event_id));
            }
        }
        Ok(())
    }

    fn append_unchecked(&mut self, block: Block) {
        self.by_hash.insert(block.block_hash, block.height);
        for event in &block.events {
            self.event_ids.insert(event.event_id);
        }
        self.blocks.push(block);
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic fork choice.
///
/// Both branches descend from the same block; `local_first` and
/// `candidate_first` are the hashes of the first block after the
/// divergence point on each side. Prefer the branch with the greater tip
/// height; on a tie, the lexicographically smaller first divergent block
/// hash wins. Every honest node observing the same two branches reaches
/// the same verdict.
pub fn candidate_branch_wins(
    local_tip_height: u64,
    local_first: &BlockHash,
    candidate_tip_height: u64,
    candidate_first: &BlockHash,
) -> bool {
    if candidate_tip_height != local_tip_height {
        return candidate_tip_height > local_tip_height;
    }
    candidate_first < local_first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chain_is_genesis_only() {
        let chain = Chain::new();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.head().height, 0);
        assert_eq!(chain.blocks().len(), 1);
    }

    #[test]
    fn test_fork_choice_prefers_height() {
        let a = BlockHash([1u8; 32]);
        let b = BlockHash([2u8; 32]);

        assert!(candidate_branch_wins(5, &a, 6, &b));
        assert!(!candidate_branch_wins(6, &a, 5, &b));
    }

    #[test]
    fn test_fork_choice_tie_breaks_on_hash() {
        let smaller = BlockHash([1u8; 32]);
        let larger = BlockHash([2u8; 32]);

        assert!(candidate_branch_wins(5, &larger, 5, &smaller));
        assert!(!candidate_branch_wins(5, &smaller, 5, &larger));
    }

    #[test]
    fn test_fork_choice_is_antisymmetric() {
        // Exactly one of two distinct competing branches can win.
        let a = BlockHash([7u8; 32]);
        let b = BlockHash([9u8; 32]);

        let a_beats_b = candidate_branch_wins(5, &a, 5, &b);
        let b_beats_a = candidate_branch_wins(5, &b, 5, &a);

        assert_ne!(a_beats_b, b_beats_a);
    }
}
