// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Hash-linked blocks.
//!
//! A block is an immutable batch of pipeline events sealed by one node.
//! The block hash covers the header fields only:
//!
//! ```text
//! block_hash = BLAKE3(height LE || prev_hash || merkle_root || proposer)
//! ```
//!
//! The merkle root in turn commits the header to the full event sequence,
//! and the proposer signs the same header preimage the hash covers.

use crate::crypto::{NodeId, NodeKeypair, Signature};
use crate::error::CryptoError;
use crate::event::PipelineEvent;
use crate::merkle::merkle_root;
use crate::types::hash::BlockHash;
use serde::{Deserialize, Serialize};

/// `prev_hash` of the genesis block.
pub const GENESIS_PREV_HASH: BlockHash = BlockHash::ZERO;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub prev_hash: BlockHash,
    pub events: Vec<PipelineEvent>,
    pub merkle_root: BlockHash,
    pub proposer: NodeId,
    pub proposer_signature: Signature,
    pub block_hash: BlockHash,
}

impl Block {
    /// The constant genesis block, identical on every node.
    pub fn genesis() -> Self {
        let root = merkle_root(&[]);
        let hash = Self::compute_hash(0, &GENESIS_PREV_HASH, &root, &NodeId::UNSET);
        Self {
            height: 0,
            prev_hash: GENESIS_PREV_HASH,
            events: Vec::new(),
            merkle_root: root,
            proposer: NodeId::UNSET,
            proposer_signature: Signature::EMPTY,
            block_hash: hash,
        }
    }

    /// Seal `events` into a new block on top of `prev_hash`.
    ///
    /// Computes the merkle root, signs the header, and fills in the block
    /// hash. The caller is responsible for choosing the right height and
    /// predecessor; `validate_block` re-checks both before commit.
    pub fn seal(
        height: u64,
        prev_hash: BlockHash,
        events: Vec<PipelineEvent>,
        keypair: &NodeKeypair,
    ) -> Self {
        let leaves: Vec<BlockHash> = events.iter().map(|e| e.digest()).collect();
        let root = merkle_root(&leaves);
        let proposer = keypair.node_id();
        let header = Self::header_bytes(height, &prev_hash, &root, &proposer);
        let signature = keypair.sign(&header);
        let hash = BlockHash::from(blake3::hash(&header));

        Self {
            height,
            prev_hash,
            events,
            merkle_root: root,
            proposer,
            proposer_signature: signature,
            block_hash: hash,
        }
    }

    /// Canonical header preimage: the bytes both hashed and signed.
    pub fn header_bytes(
        height: u64,
        prev_hash: &BlockHash,
        merkle_root: &BlockHash,
        proposer: &NodeId,
    ) -> [u8; 104] {
        let mut out = [0u8; 104];
        out[0..8].copy_from_slice(&height.to_le_bytes());
        out[8..40].copy_from_slice(prev_hash.as_bytes());
        out[40..72].copy_from_slice(merkle_root.as_bytes());
        out[72..104].copy_from_slice(proposer.as_bytes());
        out
    }

    pub fn compute_hash(
        height: u64,
        prev_hash: &BlockHash,
        merkle_root: &BlockHash,
        proposer: &NodeId,
    ) -> BlockHash {
        let header = Self::header_bytes(height, prev_hash, merkle_root, proposer);
        BlockHash::from(blake3::hash(&header))
    }

    /// Recompute the merkle root from the carried events.
    pub fn recompute_merkle_root(&self) -> BlockHash {
        let leaves: Vec<BlockHash> = self.events.iter().map(|e| e.digest()).collect();
        merkle_root(&leaves)
    }

    /// Recompute the block hash from the carried header fields.
    pub fn recompute_hash(&self) -> BlockHash {
        Self::compute_hash(
            self.height,
            &self.prev_hash,
            &self.merkle_root,
            &self.proposer,
        )
    }

    /// Verify the proposer's signature over the header preimage.
    pub fn verify_proposer_signature(&self) -> Result<(), CryptoError> {
        let header = Self::header_bytes(
            self.height,
            &self.prev_hash,
            &self.merkle_root,
            &self.proposer,
        );
        self.proposer.verify(&header, &self.proposer_signature)
    }
}
