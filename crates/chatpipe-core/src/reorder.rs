//! Per-stream receive-side sequence reassembly.
//!
//! The chat transport guarantees neither ordering nor exactly-once
//! delivery: messages arrive shuffled, and a failed poll replays everything
//! since the last committed offset. This buffer is the only source of
//! in-order delivery. Each inbound data frame is offered with its sequence
//! number; payloads come back out strictly in sequence, duplicates vanish,
//! and early arrivals wait for their predecessors.
//!
//! The buffer is capped. Blowing past the cap means a predecessor frame
//! will never arrive (or a peer is flooding), and the owning stream is torn
//! down rather than buffering without bound.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

/// Default cap on frames waiting for a predecessor.
pub const DEFAULT_CAPACITY: usize = 256;

/// Too many out-of-order frames are parked; the stream should be torn down.
#[derive(Debug, Error)]
#[error("reorder buffer overflow: {pending} frames parked waiting for seq {expected}")]
pub struct ReorderOverflow {
    pub pending: usize,
    pub expected: u64,
}

/// Reassembles one stream's data frames into sequence order.
#[derive(Debug)]
pub struct ReorderBuffer {
    /// Next sequence number to deliver.
    next_seq: u64,
    /// Early arrivals, keyed by sequence number (all keys > `next_seq`).
    pending: BTreeMap<u64, Bytes>,
    capacity: usize,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
            capacity,
        }
    }

    /// The next sequence number this buffer will deliver.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Number of frames parked waiting for a predecessor.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Offers one inbound frame.
    ///
    /// Returns the payloads that became deliverable, in sequence order:
    /// empty for an early arrival (parked) or a replayed duplicate
    /// (discarded), one or more when the frame plugs the gap in front of
    /// parked successors.
    pub fn accept(&mut self, seq: u64, payload: Bytes) -> Result<Vec<Bytes>, ReorderOverflow> {
        if seq < self.next_seq {
            // Replay of an already-delivered frame.
            return Ok(Vec::new());
        }
        if seq > self.next_seq {
            // Early arrival. Inserting over an existing key is a replayed
            // duplicate of a parked frame; the payloads are identical.
            self.pending.insert(seq, payload);
            if self.pending.len() > self.capacity {
                return Err(ReorderOverflow {
                    pending: self.pending.len(),
                    expected: self.next_seq,
                });
            }
            return Ok(Vec::new());
        }

        let mut ready = vec![payload];
        self.next_seq += 1;
        while let Some(next) = self.pending.remove(&self.next_seq) {
            ready.push(next);
            self.next_seq += 1;
        }
        Ok(ready)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
