// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Pending event log.
//!
//! Append-only FIFO of accepted-but-not-yet-sealed pipeline events.
//! Acceptance gating happens here: a rejected event never enters the log.
//! Accepted events are persisted before the append returns, so pending
//! work survives a restart.
//!
//! A drained batch stays accounted for (its event ids still block
//! duplicates) until the sealed block commits; if sealing fails or a
//! reorg abandons the block, `requeue` puts the batch back at the head of
//! the log in its original order. Local submission is therefore
//! at-least-once: an accepted event is eventually sealed or explicitly
//! surfaced, never silently dropped.

use crate::errors::RejectReason;
use crate::storage::{keys, RecordStore, StoreError};
use forgeline_kernel::event::{EventKind, PipelineEvent};
use forgeline_kernel::types::id::{EventId, PipelineId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Receipt for an accepted event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRef {
    pub event_id: EventId,
    pub seq: u64,
}

/// One drained, in-flight sealing batch.
#[derive(Debug, Default)]
pub struct DrainedBatch {
    pub entries: Vec<(u64, PipelineEvent)>,
}

impl DrainedBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_seq(&self) -> Option<u64> {
        self.entries.iter().map(|(s, _)| *s).max()
    }
}

struct LogInner {
    pending: VecDeque<(u64, PipelineEvent)>,
    /// Ids pending in the queue or drained into an in-flight batch.
    in_flight_ids: FxHashSet<EventId>,
    /// Pipelines with a pending/in-flight Create, so follow-up events can
    /// be accepted before the Create is sealed.
    pending_creates: FxHashMap<PipelineId, usize>,
    next_seq: u64,
}

pub struct EventLog {
    store: Arc<dyn RecordStore>,
    inner: Mutex<LogInner>,
    /// Signalled when the queue reaches the seal threshold.
    threshold: Notify,
    threshold_len: usize,
}

impl EventLog {
    /// Open the log, restoring pending entries above the sealed
    /// watermark.
    pub fn open(store: Arc<dyn RecordStore>, threshold_len: usize) -> Result<Self, StoreError> {
        let watermark = match store.get(&keys::sealed_watermark())? {
            Some(raw) => Some(decode_u64(&raw)?),
            None => None,
        };

        let (start, end) = keys::pending_range();
        let mut pending = VecDeque::new();
        let mut in_flight_ids = FxHashSet::default();
        let mut pending_creates: FxHashMap<PipelineId, usize> = FxHashMap::default();
        let mut next_seq = watermark.map(|w| w + 1).unwrap_or(0);

        for (key, value) in store.range_scan(&start, &end)? {
            let seq = decode_seq_key(&key)?;
            next_seq = next_seq.max(seq + 1);
            if watermark.is_some_and(|w| seq <= w) {
                continue;
            }

            let (event, _): (PipelineEvent, usize) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::Corrupt(format!("pending event {}: {}", seq, e)))?;

            in_flight_ids.insert(event.event_id);
            if event.kind == EventKind::Create {
                *pending_creates.entry(event.pipeline_id).or_default() += 1;
            }
            pending.push_back((seq, event));
        }

        if !pending.is_empty() {
            tracing::info!("restored {} pending events from the store", pending.len());
        }

        Ok(Self {
            store,
            inner: Mutex::new(LogInner {
                pending,
                in_flight_ids,
                pending_creates,
                next_seq,
            }),
            threshold: Notify::new(),
            threshold_len,
        })
    }

    /// Gate and append one event.
    ///
    /// `committed_duplicate` and `pipeline_materialized` are facts about
    /// the committed chain supplied by the coordinator; the log itself
    /// knows what is pending.
    pub fn append(
        &self,
        event: PipelineEvent,
        committed_duplicate: bool,
        pipeline_materialized: bool,
    ) -> Result<EventRef, RejectReason> {
        if event.verify_signature().is_err() {
            return Err(RejectReason::InvalidSignature);
        }
        if event.decode_payload().is_err() {
            return Err(RejectReason::MalformedPayload);
        }

        let mut inner = self.inner.lock().unwrap();

        if committed_duplicate || inner.in_flight_ids.contains(&event.event_id) {
            return Err(RejectReason::DuplicateEvent);
        }
        if event.kind != EventKind::Create
            && !pipeline_materialized
            && !inner.pending_creates.contains_key(&event.pipeline_id)
        {
            return Err(RejectReason::UnknownPipeline);
        }

        let seq = inner.next_seq;
        let encoded = bincode::serde::encode_to_vec(&event, bincode::config::standard())
            .map_err(|e| {
                tracing::error!("pending event encode failed: {}", e);
                RejectReason::Storage
            })?;
        if let Err(e) = self.store.put(&keys::pending(seq), &encoded) {
            tracing::error!("pending event persist failed: {}", e);
            return Err(RejectReason::Storage);
        }

        inner.next_seq += 1;
        inner.in_flight_ids.insert(event.event_id);
        if event.kind == EventKind::Create {
            *inner.pending_creates.entry(event.pipeline_id).or_default() += 1;
        }
        let event_id = event.event_id;
        inner.pending.push_back((seq, event));

        if inner.pending.len() >= self.threshold_len {
            self.threshold.notify_one();
        }

        Ok(EventRef { event_id, seq })
    }

    /// Remove up to `max_n` events in FIFO order for sealing. The batch
    /// stays accounted for until `mark_sealed` or `requeue`.
    pub fn drain(&self, max_n: usize) -> DrainedBatch {
        let mut inner = self.inner.lock().unwrap();
        let take = max_n.min(inner.pending.len());
        let entries: Vec<(u64, PipelineEvent)> = inner.pending.drain(..take).collect();
        DrainedBatch { entries }
    }

    /// Return a failed batch to the head of the log in original order.
    pub fn requeue(&self, batch: DrainedBatch) {
        let mut inner = self.inner.lock().unwrap();
        for entry in batch.entries.into_iter().rev() {
            inner.pending.push_front(entry);
        }
    }

    /// The batch's block committed: advance the durable watermark and
    /// release its ids and pending-create counts.
    pub fn mark_sealed(&self, batch: &DrainedBatch) -> Result<(), StoreError> {
        let Some(max_seq) = batch.max_seq() else {
            return Ok(());
        };
        self.store
            .put(&keys::sealed_watermark(), &max_seq.to_le_bytes())?;

        let mut inner = self.inner.lock().unwrap();
        for (_, event) in &batch.entries {
            inner.in_flight_ids.remove(&event.event_id);
            if event.kind == EventKind::Create {
                if let Some(count) = inner.pending_creates.get_mut(&event.pipeline_id) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        inner.pending_creates.retain(|_, count| *count > 0);
        Ok(())
    }

    /// Re-admit events abandoned by a reorg. They were already committed
    /// once, so gating is limited to dropping ids the new branch already
    /// carries (the caller filters those) and re-persisting under fresh
    /// sequences.
    pub fn restore(&self, events: Vec<PipelineEvent>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut restored = 0;
        for event in events {
            if inner.in_flight_ids.contains(&event.event_id) {
                continue;
            }
            let seq = inner.next_seq;
            let encoded = bincode::serde::encode_to_vec(&event, bincode::config::standard())
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            self.store.put(&keys::pending(seq), &encoded)?;

            inner.next_seq += 1;
            inner.in_flight_ids.insert(event.event_id);
            if event.kind == EventKind::Create {
                *inner.pending_creates.entry(event.pipeline_id).or_default() += 1;
            }
            inner.pending.push_back((seq, event));
            restored += 1;
        }

        if restored > 0 && inner.pending.len() >= self.threshold_len {
            self.threshold.notify_one();
        }
        Ok(restored)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Wait until the queue crosses the seal threshold.
    pub async fn threshold_reached(&self) {
        self.threshold.notified().await;
    }
}

/// Watermark values are stored little-endian.
fn decode_u64(raw: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::Corrupt("u64 record of wrong length".to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Pending keys end in a big-endian sequence so they range-scan in order.
fn decode_seq_key(key: &[u8]) -> Result<u64, StoreError> {
    if key.len() < 8 {
        return Err(StoreError::Corrupt("pending key too short".to_string()));
    }
    let bytes: [u8; 8] = key[key.len() - 8..].try_into().unwrap();
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;
    use forgeline_kernel::crypto::NodeKeypair;
    use forgeline_kernel::event::{CreatePayload, EventPayload, StageStatus, StageUpdatePayload};
    use forgeline_kernel::types::time::HybridTimestamp;

    fn keypair() -> NodeKeypair {
        NodeKeypair::from_seed([17u8; 32])
    }

    fn log() -> EventLog {
        EventLog::open(Arc::new(MemStore::new()), 1024).unwrap()
    }

    fn create(pipeline: PipelineId, kp: &NodeKeypair) -> PipelineEvent {
        let payload = EventPayload::Create(CreatePayload {
            name: "p".to_string(),
            stages: vec!["build".to_string()],
        });
        PipelineEvent::build(pipeline, &payload, HybridTimestamp::new(5, 0), kp).unwrap()
    }

    fn stage_update(pipeline: PipelineId, kp: &NodeKeypair) -> PipelineEvent {
        let payload = EventPayload::StageUpdate(StageUpdatePayload {
            stage: "build".to_string(),
            status: StageStatus::Running,
        });
        PipelineEvent::build(pipeline, &payload, HybridTimestamp::new(6, 0), kp).unwrap()
    }

    #[test]
    fn test_tampered_event_rejected() {
        let kp = keypair();
        let log = log();

        let mut event = create(PipelineId::new(), &kp);
        event.payload[0] ^= 0xFF;

        assert_eq!(
            log.append(event, false, false),
            Err(RejectReason::InvalidSignature)
        );
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn test_unknown_pipeline_rejected() {
        let kp = keypair();
        let log = log();

        let event = stage_update(PipelineId::new(), &kp);
        assert_eq!(
            log.append(event, false, false),
            Err(RejectReason::UnknownPipeline)
        );
    }

    #[test]
    fn test_pending_create_admits_followups() {
        let kp = keypair();
        let log = log();
        let pipeline = PipelineId::new();

        log.append(create(pipeline, &kp), false, false).unwrap();
        // The Create has not been sealed, but follow-ups are accepted.
        log.append(stage_update(pipeline, &kp), false, false).unwrap();

        assert_eq!(log.pending_len(), 2);
    }

    #[test]
    fn test_duplicate_rejected_while_in_flight() {
        let kp = keypair();
        let log = log();

        let event = create(PipelineId::new(), &kp);
        log.append(event.clone(), false, false).unwrap();

        assert_eq!(
            log.append(event.clone(), false, false),
            Err(RejectReason::DuplicateEvent)
        );

        // Drained but not yet sealed: still a duplicate.
        let batch = log.drain(10);
        assert_eq!(
            log.append(event, false, false),
            Err(RejectReason::DuplicateEvent)
        );
        log.requeue(batch);
    }

    #[test]
    fn test_drain_and_requeue_preserve_order() {
        let kp = keypair();
        let log = log();

        let events: Vec<PipelineEvent> =
            (0..3).map(|_| create(PipelineId::new(), &kp)).collect();
        for event in &events {
            log.append(event.clone(), false, false).unwrap();
        }

        let batch = log.drain(2);
        assert_eq!(log.pending_len(), 1);
        log.requeue(batch);

        let drained = log.drain(3);
        let ids: Vec<EventId> = drained.entries.iter().map(|(_, e)| e.event_id).collect();
        let expected: Vec<EventId> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, expected, "requeue must restore original FIFO order");
    }

    #[test]
    fn test_pending_survives_reopen_above_watermark() {
        let kp = keypair();
        let store: Arc<dyn RecordStore> = Arc::new(MemStore::new());

        let sealed_pipeline = PipelineId::new();
        let pending_pipeline = PipelineId::new();

        {
            let log = EventLog::open(store.clone(), 1024).unwrap();
            log.append(create(sealed_pipeline, &kp), false, false).unwrap();
            let batch = log.drain(1);
            log.mark_sealed(&batch).unwrap();

            log.append(create(pending_pipeline, &kp), false, false).unwrap();
        }

        let log = EventLog::open(store, 1024).unwrap();
        assert_eq!(log.pending_len(), 1);
        let batch = log.drain(1);
        assert_eq!(batch.entries[0].1.pipeline_id, pending_pipeline);
    }
}
