// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Node-level error types.

use crate::storage::StoreError;
use forgeline_kernel::error::ValidationError;
use thiserror::Error;

/// Why a submitted event was rejected synchronously. Rejected events
/// never enter the event log.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("event signature does not verify against the issuing node's known key")]
    InvalidSignature,

    #[error("pipeline is unknown and the event is not a Create")]
    UnknownPipeline,

    #[error("event id is already pending or committed")]
    DuplicateEvent,

    #[error("event payload does not decode against its kind")]
    MalformedPayload,

    #[error("event could not be persisted")]
    Storage,
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("event rejected: {0}")]
    Reject(#[from] RejectReason),

    #[error("block validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("chain divergence exceeds the reorg limit")]
    ChainDivergenceTooDeep,

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer-session failures. These terminate the session and schedule a
/// reconnect; they never abort the local sealing or commit path.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer operation timed out")]
    PeerTimeout,

    #[error("peer closed the connection")]
    Closed,

    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    #[error("message decode failed: {0}")]
    Decode(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("peer block failed validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("chain divergence exceeds the reorg limit")]
    ChainDivergenceTooDeep,

    #[error("local commit failed: {0}")]
    Local(String),
}
