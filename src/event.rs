// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Pipeline events: the canonical language of state transitions.
//!
//! Every change to pipeline state is expressed as a signed
//! `PipelineEvent`. The event kinds form a closed enum, so extending the
//! vocabulary is a compile-time exercise: every `match` over `EventKind`
//! or `EventPayload` must be updated before the crate builds again.
//!
//! # Determinism Guarantees
//! - Canonical little-endian signing bytes, independent of serde framing
//! - Signatures use deterministic nonces
//! - Events are immutable once signed
//! - Same committed events => same materialized views, on any node

use crate::crypto::{NodeId, NodeKeypair, Signature};
use crate::error::{CryptoError, PayloadError};
use crate::types::hash::BlockHash;
use crate::types::id::{EventId, PipelineId};
use crate::types::time::HybridTimestamp;
use serde::{Deserialize, Serialize};

/// Closed set of event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Register a new pipeline with its declared stages.
    Create,
    /// Move one stage of a pipeline to a new status.
    StageUpdate,
    /// Move the pipeline itself to a new status.
    StatusChange,
    /// Attach a free-form key/value annotation.
    Annotate,
}

impl EventKind {
    /// Stable tag byte used in signing bytes and state hashing.
    pub fn tag(&self) -> u8 {
        match self {
            EventKind::Create => 1,
            EventKind::StageUpdate => 2,
            EventKind::StatusChange => 3,
            EventKind::Annotate => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Create => "Create",
            EventKind::StageUpdate => "StageUpdate",
            EventKind::StatusChange => "StatusChange",
            EventKind::Annotate => "Annotate",
        }
    }
}

/// Status of a single pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn tag(&self) -> u8 {
        match self {
            StageStatus::Pending => 0,
            StageStatus::Running => 1,
            StageStatus::Succeeded => 2,
            StageStatus::Failed => 3,
        }
    }
}

/// Status of a pipeline as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl PipelineStatus {
    pub fn tag(&self) -> u8 {
        match self {
            PipelineStatus::Created => 0,
            PipelineStatus::Running => 1,
            PipelineStatus::Succeeded => 2,
            PipelineStatus::Failed => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePayload {
    pub name: String,
    /// Declared stage names, in execution order. May be empty; stages can
    /// also appear later through `StageUpdate`.
    pub stages: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageUpdatePayload {
    pub stage: String,
    pub status: StageStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangePayload {
    pub status: PipelineStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatePayload {
    pub key: String,
    pub value: String,
}

/// Decoded form of an event payload.
///
/// On the wire and in blocks the payload is opaque bytes; the state
/// machine decodes it against the event's `kind`. The correspondence is
/// one payload variant per kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    Create(CreatePayload),
    StageUpdate(StageUpdatePayload),
    StatusChange(StatusChangePayload),
    Annotate(AnnotatePayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Create(_) => EventKind::Create,
            EventPayload::StageUpdate(_) => EventKind::StageUpdate,
            EventPayload::StatusChange(_) => EventKind::StatusChange,
            EventPayload::Annotate(_) => EventKind::Annotate,
        }
    }

    /// Encode to the opaque payload bytes carried by the event.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let config = bincode::config::standard();
        let result = match self {
            EventPayload::Create(p) => bincode::serde::encode_to_vec(p, config),
            EventPayload::StageUpdate(p) => bincode::serde::encode_to_vec(p, config),
            EventPayload::StatusChange(p) => bincode::serde::encode_to_vec(p, config),
            EventPayload::Annotate(p) => bincode::serde::encode_to_vec(p, config),
        };
        result.map_err(|e| PayloadError::Encode(e.to_string()))
    }

    /// Decode opaque payload bytes against the declared kind.
    ///
    /// A decode must consume the whole buffer; trailing bytes mean the
    /// payload was not produced by `encode` and are rejected.
    pub fn decode(kind: EventKind, bytes: &[u8]) -> Result<Self, PayloadError> {
        let config = bincode::config::standard();
        match kind {
            EventKind::Create => {
                let (p, n): (CreatePayload, usize) =
                    bincode::serde::decode_from_slice(bytes, config)
                        .map_err(|_| PayloadError::Malformed("Create"))?;
                if n != bytes.len() {
                    return Err(PayloadError::Malformed("Create"));
                }
                Ok(EventPayload::Create(p))
            }
            EventKind::StageUpdate => {
                let (p, n): (StageUpdatePayload, usize) =
                    bincode::serde::decode_from_slice(bytes, config)
                        .map_err(|_| PayloadError::Malformed("StageUpdate"))?;
                if n != bytes.len() {
                    return Err(PayloadError::Malformed("StageUpdate"));
                }
                Ok(EventPayload::StageUpdate(p))
            }
            EventKind::StatusChange => {
                let (p, n): (StatusChangePayload, usize) =
                    bincode::serde::decode_from_slice(bytes, config)
                        .map_err(|_| PayloadError::Malformed("StatusChange"))?;
                if n != bytes.len() {
                    return Err(PayloadError::Malformed("StatusChange"));
                }
                Ok(EventPayload::StatusChange(p))
            }
            EventKind::Annotate => {
                let (p, n): (AnnotatePayload, usize) =
                    bincode::serde::decode_from_slice(bytes, config)
                        .map_err(|_| PayloadError::Malformed("Annotate"))?;
                if n != bytes.len() {
                    return Err(PayloadError::Malformed("Annotate"));
                }
                Ok(EventPayload::Annotate(p))
            }
        }
    }
}

/// A signed, immutable pipeline event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_id: EventId,
    pub pipeline_id: PipelineId,
    pub kind: EventKind,
    /// Opaque payload bytes; decoded per-kind by the state machine.
    pub payload: Vec<u8>,
    pub issuing_node: NodeId,
    pub timestamp: HybridTimestamp,
    pub signature: Signature,
}

impl PipelineEvent {
    /// Build and sign a new event.
    pub fn build(
        pipeline_id: PipelineId,
        payload: &EventPayload,
        timestamp: HybridTimestamp,
        keypair: &NodeKeypair,
    ) -> Result<Self, PayloadError> {
        let mut event = Self {
            event_id: EventId::new(),
            pipeline_id,
            kind: payload.kind(),
            payload: payload.encode()?,
            issuing_node: keypair.node_id(),
            timestamp,
            signature: Signature::EMPTY,
        };
        event.signature = keypair.sign(&event.signing_bytes());
        Ok(event)
    }

    /// Canonical bytes covered by the event signature.
    ///
    /// Fixed-order little-endian field walk; the signature itself is
    /// excluded. Any change to these bytes is a wire-format break.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 16 + 1 + 4 + self.payload.len() + 32 + 12);
        out.extend_from_slice(self.event_id.as_bytes());
        out.extend_from_slice(self.pipeline_id.as_bytes());
        out.push(self.kind.tag());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(self.issuing_node.as_bytes());
        out.extend_from_slice(&self.timestamp.wall_ms.to_le_bytes());
        out.extend_from_slice(&self.timestamp.seq.to_le_bytes());
        out
    }

    /// Verify the event signature against the issuing node's key.
    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        self.issuing_node
            .verify(&self.signing_bytes(), &self.signature)
    }

    /// BLAKE3 digest of the full event (signing bytes plus signature).
    /// These digests are the merkle leaves of the containing block.
    pub fn digest(&self) -> BlockHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signing_bytes());
        hasher.update(&self.signature.0);
        BlockHash::from(hasher.finalize())
    }

    /// Decode the opaque payload against this event's kind.
    pub fn decode_payload(&self) -> Result<EventPayload, PayloadError> {
        EventPayload::decode(self.kind, &self.payload)
    }
}
