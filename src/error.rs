//! Error types.

use crate::crypto::NodeId;
use crate::types::id::EventId;
use thiserror::Error;

/// Signature and key failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    SignatureVerificationFailed,
}

/// Block validation failures, one variant per check.
///
/// A block that fails any check is rejected as a whole; there is no
/// partial acceptance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("block height {found} does not extend head height {head}")]
    HeightMismatch { head: u64, found: u64 },

    #[error("prev_hash does not match the head block hash")]
    PrevHashMismatch,

    #[error("merkle root does not match the block's events")]
    MerkleRootMismatch,

    #[error("block hash does not match the header")]
    BlockHashMismatch,

    #[error("proposer {0} is not a known node")]
    UnknownProposer(NodeId),

    #[error("proposer signature does not verify")]
    BadProposerSignature,

    #[error("signature of event {0} does not verify")]
    BadEventSignature(EventId),

    #[error("event {0} is already committed")]
    DuplicateEvent(EventId),
}

/// Event payload encode/decode failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload does not decode as a {0} payload")]
    Malformed(&'static str),
    #[error("payload encoding failed: {0}")]
    Encode(String),
}
