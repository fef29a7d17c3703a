// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Hybrid timestamps.
//!
//! Events carry a wall-clock reading plus a per-node monotonic sequence
//! number. The kernel treats the pair as opaque ordered data: no
//! validation rule and no replay decision depends on it, so clock skew
//! between nodes can never fork the chain. The clock that produces these
//! lives in the node crate.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Milliseconds since the Unix epoch at issue time.
    pub wall_ms: u64,
    /// Per-node sequence, strictly increasing even if the wall clock steps
    /// backwards.
    pub seq: u32,
}

impl HybridTimestamp {
    pub fn new(wall_ms: u64, seq: u32) -> Self {
        Self { wall_ms, seq }
    }
}
