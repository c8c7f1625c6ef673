//! Per-session pipeline state shared by the producer callbacks, the writer
//! thread and whatever requests termination.

use crate::gains::GainEventChannel;
use crate::ring::{BlockDescriptor, BoundedRing, RingUsage, SampleRing};
use crate::status::{SharedStatus, StreamStatus};

/// Ring sizes, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCapacities {
    pub blocks: usize,
    /// In 16-bit values; each block takes twice its sample count (I then Q).
    pub samples: usize,
    /// `None` when gain changes are not recorded.
    pub gain_changes: Option<usize>,
}

pub struct StreamBuffers {
    pub status: SharedStatus,
    pub blocks: BoundedRing<BlockDescriptor>,
    pub samples: SampleRing,
    pub gain_changes: Option<GainEventChannel>,
}

impl StreamBuffers {
    pub fn new(capacities: &BufferCapacities) -> Self {
        Self {
            status: SharedStatus::new(),
            blocks: BoundedRing::with_capacity(capacities.blocks),
            samples: SampleRing::with_capacity(capacities.samples),
            gain_changes: capacities.gain_changes.map(GainEventChannel::with_capacity),
        }
    }

    /// Sets a fatal status and wakes the writer so it notices.
    pub fn fail(&self, failure: StreamStatus) {
        if self.status.fail(failure) {
            self.blocks.wake();
        }
    }

    /// Asks producers to close their streams. Safe to call repeatedly and
    /// from any thread.
    pub fn request_terminate(&self) -> bool {
        self.status.request_terminate()
    }

    pub fn usage(&self) -> BufferUsage {
        BufferUsage {
            blocks: self.blocks.usage(),
            samples: self.samples.usage(),
            gain_changes: self.gain_changes.as_ref().map(GainEventChannel::usage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage {
    pub blocks: RingUsage,
    pub samples: RingUsage,
    pub gain_changes: Option<RingUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_ring_optional() {
        let buffers = StreamBuffers::new(&BufferCapacities {
            blocks: 4,
            samples: 64,
            gain_changes: None,
        });
        assert!(buffers.gain_changes.is_none());
        let usage = buffers.usage();
        assert_eq!(usage.blocks.capacity, 4);
        assert_eq!(usage.samples.capacity, 64);
        assert_eq!(usage.gain_changes, None);
    }

    #[test]
    fn test_fail_only_once() {
        let buffers = StreamBuffers::new(&BufferCapacities {
            blocks: 1,
            samples: 1,
            gain_changes: Some(1),
        });
        buffers.status.start();
        buffers.fail(StreamStatus::BlocksBufferFull);
        buffers.fail(StreamStatus::SamplesBufferFull);
        assert_eq!(buffers.status.load(), StreamStatus::BlocksBufferFull);
        assert!(!buffers.request_terminate());
    }
}
