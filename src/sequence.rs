//! 32-bit hardware sample sequence numbers.
//!
//! The device advances a per-channel sample counter modulo 2^32. Gaps are
//! detected by comparing the first sample number of a block against the one
//! expected from the previous block.

/// "Next expected" value before the first block has been seen.
pub const UNINITIALIZED: u32 = 0xFFFF_FFFF;

/// Number of samples between `expected` and `actual`, accounting for the
/// counter wrapping at 2^32.
pub fn wraparound_diff(expected: u32, actual: u32) -> u32 {
    if expected < actual {
        actual - expected
    } else {
        u32::MAX.wrapping_sub(expected - actual).wrapping_add(1)
    }
}

/// Rounds a pre-decimation sample boundary to where the hardware decimator
/// actually places it. The internal decimator runs a 2-in-4 duty cycle, so
/// boundaries in the upper half of each group of four move up by one.
pub fn round_boundary(value: u64) -> u64 {
    value + if value % 4 < 2 { 0 } else { 1 }
}

/// First sample number expected after a block of `num_samples` starting at
/// `first_sample_num`, given the device's internal decimation factor.
/// The pre-decimation boundary is computed in 64 bits so large sample
/// numbers do not overflow before being divided back down.
pub fn next_expected_sample_num(first_sample_num: u32, num_samples: u32, internal_decimation: u32) -> u32 {
    let decimation = u64::from(internal_decimation.max(1));
    let boundary = u64::from(first_sample_num.wrapping_add(num_samples)) * decimation;
    (round_boundary(boundary) / decimation) as u32
}

/// Tracks the expected next sample number of one stream and reports gaps.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    next: u32,
    internal_decimation: u32,
}

impl SequenceTracker {
    pub fn new(internal_decimation: u32) -> Self {
        Self {
            next: UNINITIALIZED,
            internal_decimation,
        }
    }

    pub fn expected(&self) -> Option<u32> {
        (self.next != UNINITIALIZED).then_some(self.next)
    }

    /// Number of samples missing before a block starting at `first_sample_num`.
    /// Zero for the first block or when the block is contiguous.
    pub fn gap_before(&self, first_sample_num: u32) -> u32 {
        match self.expected() {
            Some(expected) if expected != first_sample_num => wraparound_diff(expected, first_sample_num),
            _ => 0,
        }
    }

    /// Records a block and moves the expectation past it.
    pub fn advance(&mut self, first_sample_num: u32, num_samples: u32) {
        self.next = next_expected_sample_num(first_sample_num, num_samples, self.internal_decimation);
    }
}
