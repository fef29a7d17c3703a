// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Hybrid event clock.
//!
//! Wall-clock milliseconds plus a per-node sequence counter. The sequence
//! resets whenever the wall clock advances and increments otherwise, so
//! timestamps issued by one node are strictly increasing even across a
//! backwards clock step. Timestamps are informational data on events;
//! nothing in validation or replay orders by them.

use forgeline_kernel::types::time::HybridTimestamp;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct HybridClock {
    last: Mutex<(u64, u32)>,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new((0, 0)),
        }
    }

    pub fn now(&self) -> HybridTimestamp {
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut last = self.last.lock().unwrap();
        let (last_ms, last_seq) = *last;

        let stamp = if wall_ms > last_ms {
            (wall_ms, 0)
        } else {
            (last_ms, last_seq + 1)
        };
        *last = stamp;

        HybridTimestamp::new(stamp.0, stamp.1)
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_strictly_increase() {
        let clock = HybridClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev, "{:?} must be after {:?}", next, prev);
            prev = next;
        }
    }
}
