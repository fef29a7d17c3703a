// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Chain store: the one piece of shared mutable state.
//!
//! Holds the canonical chain and the materialized pipeline views behind a
//! single `RwLock`. The write half is the chain-mutation critical
//! section: every commit (a locally sealed block or a peer block)
//! passes through it alone, so concurrent commits are never interleaved.
//! Readers share the read half and always observe a fully committed
//! chain.
//!
//! # Commit barrier
//! 1. Validate against the in-memory chain (all-or-nothing)
//! 2. Persist the block and the head pointer (fsync'd)
//! 3. Append to the in-memory chain
//! 4. Apply the block's events to the materialized views
//!
//! A storage failure aborts between 2 and 3: nothing in memory changed,
//! the events stay in the pending log, and the error surfaces to the
//! operator. It is not retried automatically.
//!
//! # Recovery
//! The persisted blocks are the truth. On open every block is re-checked
//! for linkage and hash integrity, views are rebuilt by replay, and a
//! stored snapshot is only a shortcut-check: if its hash does not match
//! the replayed state at its height, the snapshot is discarded.

use crate::errors::NodeError;
use crate::storage::{keys, RecordStore, StoreError};
use forgeline_kernel::block::Block;
use forgeline_kernel::chain::{candidate_branch_wins, Chain};
use forgeline_kernel::crypto::NodeId;
use forgeline_kernel::event::PipelineEvent;
use forgeline_kernel::state::{Anomaly, LedgerState, PipelineView};
use forgeline_kernel::types::hash::BlockHash;
use forgeline_kernel::types::id::{EventId, PipelineId};
use forgeline_kernel::validate::validate_block;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cached materialized views at a height. Never authoritative; always
/// re-derivable from the chain.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerSnapshot {
    height: u64,
    state: LedgerState,
}

struct ChainInner {
    chain: Chain,
    ledger: LedgerState,
}

#[derive(Debug)]
pub struct CommitOutcome {
    pub height: u64,
    pub head_hash: BlockHash,
    pub anomalies: Vec<(EventId, Anomaly)>,
}

#[derive(Debug)]
pub enum BranchOutcome {
    /// The candidate branch won fork choice; abandoned events are
    /// returned for re-queueing.
    Adopted {
        new_height: u64,
        new_head: BlockHash,
        abandoned_events: Vec<PipelineEvent>,
    },
    /// The local branch won; nothing changed.
    LocalWins,
}

pub struct ChainStore {
    store: Arc<dyn RecordStore>,
    inner: RwLock<ChainInner>,
    snapshot_interval: u64,
}

impl ChainStore {
    /// Open the store, recovering the persisted chain or initializing a
    /// fresh one at genesis.
    pub fn open(store: Arc<dyn RecordStore>, snapshot_interval: u64) -> Result<Self, NodeError> {
        let head_height = match store.get(&keys::chain_head())? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("chain_head of wrong length".into()))?;
                Some(u64::from_le_bytes(bytes))
            }
            None => None,
        };

        let chain = match head_height {
            None => {
                let chain = Chain::new();
                persist_block(store.as_ref(), chain.head())?;
                persist_head(store.as_ref(), 0)?;
                chain
            }
            Some(head) => {
                let mut blocks = Vec::with_capacity(head as usize + 1);
                for height in 0..=head {
                    let raw = store.get(&keys::block(height))?.ok_or_else(|| {
                        StoreError::Corrupt(format!("missing block at height {}", height))
                    })?;
                    let (block, _): (Block, usize) =
                        bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                            .map_err(|e| {
                                StoreError::Corrupt(format!("block {} decode: {}", height, e))
                            })?;
                    blocks.push(block);
                }
                Chain::from_blocks(blocks)?
            }
        };

        let (ledger, anomalies) = LedgerState::replay(chain.blocks());
        for (event_id, anomaly) in &anomalies {
            tracing::warn!(event = %event_id, ?anomaly, "anomalous event skipped during replay");
        }

        // Snapshot consistency: the chain always wins. A stale or
        // diverged snapshot is dropped here and overwritten at the next
        // snapshot point.
        if let Some(raw) = store.get(&keys::snapshot())? {
            match bincode::serde::decode_from_slice::<LedgerSnapshot, _>(
                &raw,
                bincode::config::standard(),
            ) {
                Ok((snapshot, _)) => {
                    let upto = (snapshot.height.min(chain.height()) + 1) as usize;
                    let (replayed, _) = LedgerState::replay(&chain.blocks()[..upto]);
                    if snapshot.height > chain.height()
                        || replayed.state_hash() != snapshot.state.state_hash()
                    {
                        tracing::warn!(
                            snapshot_height = snapshot.height,
                            chain_height = chain.height(),
                            "snapshot diverges from replay; discarding"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!("snapshot decode failed ({}); discarding", e);
                }
            }
        }

        tracing::info!(
            height = chain.height(),
            head = ?chain.head().block_hash,
            pipelines = ledger.len(),
            "chain store ready"
        );
        metrics::gauge!("forgeline_chain_height", chain.height() as f64);

        Ok(Self {
            store,
            inner: RwLock::new(ChainInner { chain, ledger }),
            snapshot_interval,
        })
    }

    /// Current height and head hash, from a consistent read snapshot.
    pub async fn status(&self) -> (u64, BlockHash) {
        let inner = self.inner.read().await;
        (inner.chain.height(), inner.chain.head().block_hash)
    }

    pub async fn get_block(&self, height: u64) -> Option<Block> {
        self.inner.read().await.chain.get(height).cloned()
    }

    pub async fn block_hash_at(&self, height: u64) -> Option<BlockHash> {
        self.inner
            .read()
            .await
            .chain
            .get(height)
            .map(|b| b.block_hash)
    }

    pub async fn contains_event(&self, id: &EventId) -> bool {
        self.inner.read().await.chain.contains_event(id)
    }

    pub async fn pipeline_exists(&self, id: &PipelineId) -> bool {
        self.inner.read().await.ledger.get(id).is_some()
    }

    pub async fn get_pipeline(&self, id: &PipelineId) -> Option<PipelineView> {
        self.inner.read().await.ledger.get(id).cloned()
    }

    pub async fn list_pipelines(&self) -> Vec<PipelineView> {
        self.inner.read().await.ledger.iter().cloned().collect()
    }

    pub async fn state_hash(&self) -> [u8; 32] {
        self.inner.read().await.ledger.state_hash()
    }

    /// Commit one block extending the head. See the module doc for the
    /// barrier sequence.
    pub async fn commit(
        &self,
        block: Block,
        known_nodes: &FxHashSet<NodeId>,
    ) -> Result<CommitOutcome, NodeError> {
        let mut inner = self.inner.write().await;

        validate_block(&block, &inner.chain, known_nodes)?;

        persist_block(self.store.as_ref(), &block)?;
        persist_head(self.store.as_ref(), block.height)?;

        let anomalies = inner.ledger.apply_block(&block);
        let height = block.height;
        let head_hash = block.block_hash;
        inner.chain.append_validated(block);

        metrics::increment_counter!("forgeline_blocks_committed_total");
        metrics::gauge!("forgeline_chain_height", height as f64);

        if self.snapshot_interval > 0 && height % self.snapshot_interval == 0 {
            self.write_snapshot(&inner);
        }

        Ok(CommitOutcome {
            height,
            head_hash,
            anomalies,
        })
    }

    /// Attempt to adopt a competing branch that forks after
    /// `divergence_height`.
    ///
    /// Every candidate block is re-validated on a truncated clone before
    /// anything local changes; the swap happens only if the whole branch
    /// validates and wins fork choice. Events unique to the abandoned
    /// branch are returned so the coordinator can re-queue them.
    pub async fn try_adopt_branch(
        &self,
        divergence_height: u64,
        branch: Vec<Block>,
        known_nodes: &FxHashSet<NodeId>,
    ) -> Result<BranchOutcome, NodeError> {
        let mut inner = self.inner.write().await;

        let first = branch.first().ok_or_else(|| {
            NodeError::Validation(forgeline_kernel::error::ValidationError::PrevHashMismatch)
        })?;
        let local_first = inner
            .chain
            .get(divergence_height + 1)
            .map(|b| b.block_hash)
            .ok_or_else(|| {
                NodeError::Validation(forgeline_kernel::error::ValidationError::PrevHashMismatch)
            })?;

        // Re-validate the entire branch from the divergence point on a
        // clone before judging it.
        let mut candidate = inner.chain.clone();
        candidate.truncate_to(divergence_height);
        for block in &branch {
            candidate.commit(block.clone(), known_nodes)?;
        }

        if !candidate_branch_wins(
            inner.chain.height(),
            &local_first,
            candidate.height(),
            &first.block_hash,
        ) {
            return Ok(BranchOutcome::LocalWins);
        }

        // Persist the replacement branch and the new head before touching
        // memory; height keys above the new head left by a shrinking reorg
        // are bounded out by the head pointer.
        for block in &branch {
            persist_block(self.store.as_ref(), block)?;
        }
        persist_head(self.store.as_ref(), candidate.height())?;

        let abandoned = inner.chain.truncate_to(divergence_height);
        let (ledger, anomalies) = LedgerState::replay(candidate.blocks());
        for (event_id, anomaly) in &anomalies {
            tracing::warn!(event = %event_id, ?anomaly, "anomalous event skipped during reorg replay");
        }

        let new_height = candidate.height();
        let new_head = candidate.head().block_hash;
        inner.chain = candidate;
        inner.ledger = ledger;

        let abandoned_events: Vec<PipelineEvent> = abandoned
            .into_iter()
            .flat_map(|b| b.events)
            .filter(|e| !inner.chain.contains_event(&e.event_id))
            .collect();

        metrics::increment_counter!("forgeline_reorgs_total");
        metrics::gauge!("forgeline_chain_height", new_height as f64);
        tracing::info!(
            divergence = divergence_height,
            new_height,
            requeued = abandoned_events.len(),
            "reorganized onto competing branch"
        );

        Ok(BranchOutcome::Adopted {
            new_height,
            new_head,
            abandoned_events,
        })
    }

    /// Best-effort snapshot write; a failure costs replay time, never
    /// correctness.
    fn write_snapshot(&self, inner: &ChainInner) {
        let snapshot = LedgerSnapshot {
            height: inner.chain.height(),
            state: inner.ledger.clone(),
        };
        match bincode::serde::encode_to_vec(&snapshot, bincode::config::standard()) {
            Ok(encoded) => {
                if let Err(e) = self.store.put(&keys::snapshot(), &encoded) {
                    tracing::warn!("snapshot write failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("snapshot encode failed: {}", e),
        }
    }
}

fn persist_block(store: &dyn RecordStore, block: &Block) -> Result<(), StoreError> {
    let encoded = bincode::serde::encode_to_vec(block, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt(format!("block encode: {}", e)))?;
    store.put(&keys::block(block.height), &encoded)?;
    store.put(
        &keys::block_hash(&block.block_hash),
        &block.height.to_le_bytes(),
    )?;
    Ok(())
}

fn persist_head(store: &dyn RecordStore, height: u64) -> Result<(), StoreError> {
    store.put(&keys::chain_head(), &height.to_le_bytes())
}
