// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Pipeline state machine: materialized views derived from the chain.
//!
//! `LedgerState` is the current view of every pipeline, reconstructible
//! only by replaying committed events in chain order. It is never
//! mutated directly; the chain store is the sole source of truth and a
//! cached snapshot of this state is never authoritative.
//!
//! # Determinism
//! Replaying the same committed block sequence yields byte-identical
//! state on any node: pipelines iterate in `BTreeMap` order, `apply_event`
//! is a total function over the event kinds, and nothing here consults a
//! clock or any per-node data.
//!
//! Events that cannot apply (unknown pipeline, duplicate create,
//! undecodable payload) are returned as anomalies rather than errors:
//! they should be unreachable given event-log validation, but the state
//! machine must not assume the chain store is corruption-free, and every
//! replica has to skip exactly the same events.

use crate::block::Block;
use crate::event::{EventPayload, PipelineEvent, PipelineStatus, StageStatus};
use crate::types::id::{EventId, PipelineId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One stage of a pipeline's materialized view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageView {
    pub name: String,
    pub status: StageStatus,
}

/// Materialized view of a single pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineView {
    pub pipeline_id: PipelineId,
    pub name: String,
    pub stages: Vec<StageView>,
    pub current_status: PipelineStatus,
    pub annotations: Vec<(String, String)>,
    /// Height of the block containing the last event applied to this view.
    pub last_event_height: u64,
}

/// Why an event did not change the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anomaly {
    /// Non-create event for a pipeline that was never created.
    UnknownPipeline,
    /// Create for a pipeline id that already exists.
    DuplicateCreate,
    /// Payload bytes do not decode against the event kind.
    MalformedPayload,
}

/// Result of applying one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Ignored(Anomaly),
}

/// Materialized views of all pipelines.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct LedgerState {
    pipelines: BTreeMap<PipelineId, PipelineView>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PipelineId) -> Option<&PipelineView> {
        self.pipelines.get(id)
    }

    /// All pipelines, ascending by pipeline id.
    pub fn iter(&self) -> impl Iterator<Item = &PipelineView> {
        self.pipelines.values()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Apply one event from a block at `height`. Total over all event
    /// kinds; inapplicable events leave the state untouched and report
    /// why.
    pub fn apply_event(&mut self, event: &PipelineEvent, height: u64) -> ApplyOutcome {
        let payload = match event.decode_payload() {
            Ok(p) => p,
            Err(_) => return ApplyOutcome::Ignored(Anomaly::MalformedPayload),
        };

        match payload {
            EventPayload::Create(create) => {
                if self.pipelines.contains_key(&event.pipeline_id) {
                    return ApplyOutcome::Ignored(Anomaly::DuplicateCreate);
                }
                let stages = create
                    .stages
                    .into_iter()
                    .map(|name| StageView {
                        name,
                        status: StageStatus::Pending,
                    })
                    .collect();
                self.pipelines.insert(
                    event.pipeline_id,
                    PipelineView {
                        pipeline_id: event.pipeline_id,
                        name: create.name,
                        stages,
                        current_status: PipelineStatus::Created,
                        annotations: Vec::new(),
                        last_event_height: height,
                    },
                );
                ApplyOutcome::Applied
            }
            EventPayload::StageUpdate(update) => {
                let Some(view) = self.pipelines.get_mut(&event.pipeline_id) else {
                    return ApplyOutcome::Ignored(Anomaly::UnknownPipeline);
                };
                match view.stages.iter().position(|s| s.name == update.stage) {
                    Some(idx) => view.stages[idx].status = update.status,
                    // Stages may appear after creation; record them in
                    // arrival order.
                    None => view.stages.push(StageView {
                        name: update.stage,
                        status: update.status,
                    }),
                }
                view.last_event_height = height;
                ApplyOutcome::Applied
            }
            EventPayload::StatusChange(change) => {
                let Some(view) = self.pipelines.get_mut(&event.pipeline_id) else {
                    return ApplyOutcome::Ignored(Anomaly::UnknownPipeline);
                };
                view.current_status = change.status;
                view.last_event_height = height;
                ApplyOutcome::Applied
            }
            EventPayload::Annotate(note) => {
                let Some(view) = self.pipelines.get_mut(&event.pipeline_id) else {
                    return ApplyOutcome::Ignored(Anomaly::UnknownPipeline);
                };
                view.annotations.push((note.key, note.value));
                view.last_event_height = height;
                ApplyOutcome::Applied
            }
        }
    }

    /// Apply every event of a committed block, collecting anomalies for
    /// the caller to log.
    pub fn apply_block(&mut self, block: &Block) -> Vec<(EventId, Anomaly)> {
        let mut anomalies = Vec::new();
        for event in &block.events {
            if let ApplyOutcome::Ignored(anomaly) = self.apply_event(event, block.height) {
                anomalies.push((event.event_id, anomaly));
            }
        }
        anomalies
    }

    /// Replay a committed block sequence from genesis into fresh state.
    pub fn replay(blocks: &[Block]) -> (Self, Vec<(EventId, Anomaly)>) {
        let mut state = Self::new();
        let mut anomalies = Vec::new();
        for block in blocks {
            anomalies.extend(state.apply_block(block));
        }
        (state, anomalies)
    }

    /// Canonical BLAKE3 hash of the full materialized state.
    ///
    /// Fixed-order field walk over pipelines in id order; length-prefixed
    /// strings so adjacent fields cannot alias.
    ///
    /// # Hash Input Structure
    /// ```text
    /// pipeline_count (u64 LE)
    /// For each pipeline (in id order):
    ///   pipeline_id (16 bytes)
    ///   name (u32 LE len || bytes)
    ///   stage_count (u32 LE)
    ///   For each stage: name (u32 LE len || bytes) || status tag (u8)
    ///   current_status tag (u8)
    ///   annotation_count (u32 LE)
    ///   For each annotation: key, value (u32 LE len || bytes each)
    ///   last_event_height (u64 LE)
    /// ```
    pub fn state_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();

        hasher.update(&(self.pipelines.len() as u64).to_le_bytes());

        for view in self.pipelines.values() {
            hasher.update(view.pipeline_id.as_bytes());

            hasher.update(&(view.name.len() as u32).to_le_bytes());
            hasher.update(view.name.as_bytes());

            hasher.update(&(view.stages.len() as u32).to_le_bytes());
            for stage in &view.stages {
                hasher.update(&(stage.name.len() as u32).to_le_bytes());
                hasher.update(stage.name.as_bytes());
                hasher.update(&[stage.status.tag()]);
            }

            hasher.update(&[view.current_status.tag()]);

            hasher.update(&(view.annotations.len() as u32).to_le_bytes());
            for (key, value) in &view.annotations {
                hasher.update(&(key.len() as u32).to_le_bytes());
                hasher.update(key.as_bytes());
                hasher.update(&(value.len() as u32).to_le_bytes());
                hasher.update(value.as_bytes());
            }

            hasher.update(&view.last_event_height.to_le_bytes());
        }

        *hasher.finalize().as_bytes()
    }
}
