// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Merkle root over the events of a block.
//!
//! Leaves are event digests, padded to a power of two with the all-zero
//! sentinel; parents are `BLAKE3(left || right)`. The root commits a
//! block to its exact event sequence: reordering, dropping, or altering
//! any event changes the root and fails validation.

use crate::types::hash::BlockHash;

/// Padding leaf and the root of an empty event list.
pub const SENTINEL: BlockHash = BlockHash::ZERO;

fn hash_pair(left: &BlockHash, right: &BlockHash) -> BlockHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    BlockHash::from(hasher.finalize())
}

/// Compute the merkle root of `leaves`.
pub fn merkle_root(leaves: &[BlockHash]) -> BlockHash {
    if leaves.is_empty() {
        return SENTINEL;
    }

    // Pad to a power of two; a single leaf still gets a sibling so the
    // root is always the hash of a pair.
    let padded = if leaves.len() == 1 {
        2
    } else {
        leaves.len().next_power_of_two()
    };

    let mut level: Vec<BlockHash> = Vec::with_capacity(padded);
    level.extend_from_slice(leaves);
    level.resize(padded, SENTINEL);

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    level[0]
}
