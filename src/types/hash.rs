// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Canonical BLAKE3 digest type.
//!
//! BLAKE3 is the one hash primitive of the ledger: block hashes, merkle
//! nodes, event digests, and state hashes are all 32-byte BLAKE3 outputs.
//! `Ord` is derived so fork choice can tie-break on the lexicographic
//! byte order of competing block hashes.

use core::fmt;
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// All-zero digest, used as the genesis `prev_hash` and the merkle
    /// padding sentinel.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(out))
    }
}

impl From<blake3::Hash> for BlockHash {
    fn from(h: blake3::Hash) -> Self {
        Self(*h.as_bytes())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight leading bytes are enough to identify a block in logs.
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let mut h = BlockHash::ZERO;
        h.0[0] = 0xab;
        h.0[31] = 0x01;

        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(BlockHash::from_hex(&hex), Some(h));
    }

    #[test]
    fn test_ord_is_lexicographic() {
        let mut a = BlockHash::ZERO;
        let mut b = BlockHash::ZERO;
        a.0[0] = 1;
        b.0[0] = 2;

        assert!(a < b);
    }
}
