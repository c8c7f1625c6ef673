//! Gain-change events (AGC and manual gain updates reported by the device).
//!
//! Events are produced by the device's event callback, queued in their own
//! bounded ring and periodically written out by the writer thread as a flat
//! file of 16-byte records.

use std::io::{self, Write};

use bytemuck::{Pod, Zeroable};

use crate::ring::BoundedRing;

/// On-disk gain change record. Native byte order, 16 bytes, the last byte
/// is padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct GainChange {
    pub sample_num: u64,
    pub current_gain: f32,
    pub tuner: u8,
    pub gain_reduction_db: u8,
    pub lna_gain_reduction_db: u8,
    unused: u8,
}

pub const GAIN_CHANGE_RECORD_SIZE: usize = std::mem::size_of::<GainChange>();

impl GainChange {
    pub fn new(sample_num: u64, current_gain: f32, tuner: u8, gain_reduction_db: u8, lna_gain_reduction_db: u8) -> Self {
        Self {
            sample_num,
            current_gain,
            tuner,
            gain_reduction_db,
            lna_gain_reduction_db,
            unused: 0,
        }
    }

    /// Decodes one record as written by [`GainEventChannel::drain_to`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == GAIN_CHANGE_RECORD_SIZE).then(|| bytemuck::pod_read_unaligned(bytes))
    }
}

/// Bounded FIFO of pending gain changes.
pub struct GainEventChannel {
    ring: BoundedRing<GainChange>,
}

impl GainEventChannel {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: BoundedRing::with_capacity(capacity),
        }
    }

    /// Queues an event without blocking. Returns false when the ring is
    /// full; the event is lost and the caller must fail the session.
    pub fn try_push(&self, event: GainChange) -> bool {
        self.ring.push(event)
    }

    /// Writes every event that is ready right now to `sink`, oldest first,
    /// in at most two contiguous runs (the ring may wrap). The drained slots
    /// are released even when the write fails.
    pub fn drain_to<W: Write>(&self, sink: &mut W) -> io::Result<usize> {
        let ready = self.ring.take_all_ready();
        let mut run = Vec::new();
        let mut left = ready;
        let mut result = Ok(ready);
        while left > 0 {
            run.clear();
            left -= self.ring.pop_contiguous(left, &mut run);
            // After a failure keep popping so the read cursor stays in step
            if result.is_ok() {
                if let Err(e) = sink.write_all(bytemuck::cast_slice(&run)) {
                    result = Err(e);
                }
            }
        }

        self.ring.release_read(ready);
        result
    }

    pub fn usage(&self) -> crate::ring::RingUsage {
        self.ring.usage()
    }
}
