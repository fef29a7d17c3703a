// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Node coordinator: orchestrates the write path.
//!
//! Local writes travel: submit -> pending log -> seal -> validate ->
//! commit -> broadcast. Inbound peer blocks join at the commit step.
//! Sealing is serialized by a dedicated lock, so one node can never race
//! itself into a height collision; the hash and signature work happens
//! against a read snapshot of the head, outside the chain-mutation lock.

use crate::chain_store::{BranchOutcome, ChainStore, CommitOutcome};
use crate::clock::HybridClock;
use crate::config::NodeConfig;
use crate::errors::{NodeError, RejectReason};
use crate::event_log::{EventLog, EventRef};
use crate::peers::PeerRegistry;
use forgeline_kernel::block::Block;
use forgeline_kernel::crypto::{NodeId, NodeKeypair};
use forgeline_kernel::error::ValidationError;
use forgeline_kernel::event::{EventPayload, PipelineEvent};
use forgeline_kernel::types::id::PipelineId;
use rustc_hash::FxHashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::broadcast;

/// What happened to an inbound peer block.
#[derive(Debug)]
pub enum IngestOutcome {
    Committed { height: u64 },
    /// Already on our chain; nothing to do.
    AlreadyHave,
    /// At or below our head but not on our chain; the peer is behind on
    /// a competing branch and will resolve against us.
    Stale,
    /// More than one ahead; a range sync is needed first.
    Ahead { target: u64 },
    /// Same parent height as our head but a different lineage.
    ForkDetected,
}

pub struct Coordinator {
    pub(crate) cfg: NodeConfig,
    keypair: NodeKeypair,
    clock: HybridClock,
    pub(crate) event_log: EventLog,
    pub(crate) chain: ChainStore,
    pub(crate) peers: PeerRegistry,
    broadcast_tx: broadcast::Sender<Block>,
    known_nodes: RwLock<FxHashSet<NodeId>>,
    seal_lock: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(
        cfg: NodeConfig,
        keypair: NodeKeypair,
        event_log: EventLog,
        chain: ChainStore,
        peers: PeerRegistry,
    ) -> Self {
        let mut known: FxHashSet<NodeId> = peers.node_ids().into_iter().collect();
        known.insert(keypair.node_id());
        let (broadcast_tx, _) = broadcast::channel(64);

        Self {
            cfg,
            keypair,
            clock: HybridClock::new(),
            event_log,
            chain,
            peers,
            broadcast_tx,
            known_nodes: RwLock::new(known),
            seal_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn known_nodes(&self) -> FxHashSet<NodeId> {
        self.known_nodes.read().unwrap().clone()
    }

    /// Register a peer at runtime. Returns false if it was already known.
    pub fn add_peer(&self, node_id: NodeId, addr: String) -> bool {
        let added = self.peers.add_peer(node_id, addr);
        if added {
            self.known_nodes.write().unwrap().insert(node_id);
        }
        added
    }

    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<Block> {
        self.broadcast_tx.subscribe()
    }

    /// Accept a caller-submitted, already-signed event. Fast and local:
    /// gating plus one durable append, no network I/O.
    pub async fn submit_event(&self, event: PipelineEvent) -> Result<EventRef, RejectReason> {
        if !self.known_nodes().contains(&event.issuing_node) {
            metrics::increment_counter!("forgeline_events_rejected_total");
            return Err(RejectReason::InvalidSignature);
        }

        let committed_dup = self.chain.contains_event(&event.event_id).await;
        let pipeline_known = self.chain.pipeline_exists(&event.pipeline_id).await;

        let result = self.event_log.append(event, committed_dup, pipeline_known);
        match &result {
            Ok(_) => metrics::increment_counter!("forgeline_events_submitted_total"),
            Err(reason) => {
                tracing::debug!(%reason, "event rejected");
                metrics::increment_counter!("forgeline_events_rejected_total");
            }
        }
        result
    }

    /// Build, sign, and submit an event under this node's own identity.
    pub async fn submit_payload(
        &self,
        pipeline_id: PipelineId,
        payload: &EventPayload,
    ) -> Result<EventRef, RejectReason> {
        let event = PipelineEvent::build(pipeline_id, payload, self.clock.now(), &self.keypair)
            .map_err(|_| RejectReason::MalformedPayload)?;
        self.submit_event(event).await
    }

    /// Drain, seal, validate, commit, broadcast. At most one sealing
    /// operation runs at a time; a failed seal returns its batch to the
    /// head of the pending log.
    pub async fn seal_once(&self) -> Result<Option<CommitOutcome>, NodeError> {
        let _sealing = self.seal_lock.lock().await;

        let batch = self.event_log.drain(self.cfg.seal_max_events);
        if batch.is_empty() {
            return Ok(None);
        }

        let started = Instant::now();

        // Drop anything a peer block committed while it sat in the log;
        // requeueing such an event would fail DuplicateEvent forever.
        let mut events = Vec::with_capacity(batch.entries.len());
        for (_, event) in &batch.entries {
            if !self.chain.contains_event(&event.event_id).await {
                events.push(event.clone());
            }
        }
        if events.is_empty() {
            if let Err(e) = self.event_log.mark_sealed(&batch) {
                tracing::warn!("sealed watermark write failed: {}", e);
            }
            return Ok(None);
        }

        // Head snapshot only; the chain-mutation lock is not held while
        // hashing and signing.
        let (height, head_hash) = self.chain.status().await;
        let block = Block::seal(height + 1, head_hash, events, &self.keypair);

        match self.chain.commit(block.clone(), &self.known_nodes()).await {
            Ok(outcome) => {
                for (event_id, anomaly) in &outcome.anomalies {
                    tracing::warn!(event = %event_id, ?anomaly, "sealed event did not apply");
                }
                if let Err(e) = self.event_log.mark_sealed(&batch) {
                    // The block is committed; the watermark write failing
                    // only risks re-offering these events, which the
                    // duplicate check swallows.
                    tracing::warn!("sealed watermark write failed: {}", e);
                }

                metrics::histogram!(
                    "forgeline_seal_duration_seconds",
                    started.elapsed().as_secs_f64()
                );
                tracing::debug!(
                    height = outcome.height,
                    events = block.events.len(),
                    "sealed block"
                );

                // Fire-and-forget to in-sync peer sessions.
                let _ = self.broadcast_tx.send(block);
                Ok(Some(outcome))
            }
            Err(NodeError::Validation(e)) => {
                // A peer commit won the race for this height. Put the
                // batch back and let the next tick seal on the new head.
                tracing::debug!("seal lost the commit race ({}); requeueing batch", e);
                self.event_log.requeue(batch);
                Ok(None)
            }
            Err(e) => {
                tracing::error!("seal commit failed: {}", e);
                self.event_log.requeue(batch);
                Err(e)
            }
        }
    }

    /// Commit one inbound peer block.
    pub async fn ingest_block(
        &self,
        block: Block,
        from: &NodeId,
    ) -> Result<IngestOutcome, NodeError> {
        let (height, _) = self.chain.status().await;

        if block.height <= height {
            return Ok(
                if self.chain.block_hash_at(block.height).await == Some(block.block_hash) {
                    IngestOutcome::AlreadyHave
                } else {
                    IngestOutcome::Stale
                },
            );
        }

        if block.height > height + 1 {
            return Ok(IngestOutcome::Ahead {
                target: block.height,
            });
        }

        match self.chain.commit(block, &self.known_nodes()).await {
            Ok(outcome) => {
                for (event_id, anomaly) in &outcome.anomalies {
                    tracing::warn!(event = %event_id, ?anomaly, "peer event did not apply");
                }
                Ok(IngestOutcome::Committed {
                    height: outcome.height,
                })
            }
            Err(NodeError::Validation(ValidationError::PrevHashMismatch)) => {
                Ok(IngestOutcome::ForkDetected)
            }
            Err(NodeError::Validation(ValidationError::HeightMismatch { .. })) => {
                // Raced with another commit; the block is now stale or
                // ahead, and the session loop re-reads our status anyway.
                Ok(IngestOutcome::Stale)
            }
            Err(NodeError::Validation(e)) => {
                let failures = self.peers.record_validation_failure(from);
                metrics::increment_counter!("forgeline_peer_validation_failures_total");
                tracing::warn!(peer = %from, failures, "peer block failed validation: {}", e);
                Err(NodeError::Validation(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Adopt a fork-choice-winning branch and requeue whatever the
    /// abandoned blocks carried that the new branch does not.
    pub async fn adopt_branch(
        &self,
        divergence_height: u64,
        branch: Vec<Block>,
    ) -> Result<BranchOutcome, NodeError> {
        let outcome = self
            .chain
            .try_adopt_branch(divergence_height, branch, &self.known_nodes())
            .await?;

        if let BranchOutcome::Adopted {
            abandoned_events, ..
        } = &outcome
        {
            if !abandoned_events.is_empty() {
                let restored = self.event_log.restore(abandoned_events.clone())?;
                tracing::info!(restored, "requeued events from abandoned branch");
            }
        }
        Ok(outcome)
    }

    /// One pass of the background maintenance the seal timer drives.
    pub fn tick_maintenance(&self) {
        self.peers.sweep_silent();
    }

    /// Run the sealing loop: a block per interval tick, or sooner when
    /// the pending log crosses the batch threshold.
    pub async fn run_seal_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.cfg.seal_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_maintenance();
                }
                _ = self.event_log.threshold_reached() => {}
            }

            match self.seal_once().await {
                Ok(_) => {}
                Err(e) => {
                    // Commit-fatal (storage): events are requeued but we
                    // do not hot-loop against a failing disk.
                    tracing::error!("sealing failed: {}", e);
                    tokio::time::sleep(self.cfg.seal_interval()).await;
                }
            }
        }
    }
}
