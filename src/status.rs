//! Session run status shared by producers, the writer thread and the
//! termination sources (timer, signals).
//!
//! The status only ever moves forward:
//!
//! ```text
//! Starting -> Running -> Terminate -> Done
//!                 \           \
//!                  +-----------+--> Failed variants
//! ```
//!
//! Readers use relaxed loads. A stale read delays the reaction of a thread
//! by at most one poll; it can never observe a state that was not reached.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamStatus {
    Starting = 0,
    Running = 1,
    Terminate = 2,
    Done = 3,
    ProtocolMismatch = 4,
    IoFailure = 5,
    BlocksBufferFull = 6,
    SamplesBufferFull = 7,
    GainChangesBufferFull = 8,
    /// The sample source stopped delivering before the end of stream.
    Failed = 9,
}

impl StreamStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamStatus::Starting,
            1 => StreamStatus::Running,
            2 => StreamStatus::Terminate,
            3 => StreamStatus::Done,
            4 => StreamStatus::ProtocolMismatch,
            5 => StreamStatus::IoFailure,
            6 => StreamStatus::BlocksBufferFull,
            7 => StreamStatus::SamplesBufferFull,
            8 => StreamStatus::GainChangesBufferFull,
            _ => StreamStatus::Failed,
        }
    }

    /// Running or draining after a termination request.
    pub fn is_streaming(self) -> bool {
        matches!(self, StreamStatus::Running | StreamStatus::Terminate)
    }

    /// Done or any failure. Nothing leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            StreamStatus::Starting | StreamStatus::Running | StreamStatus::Terminate
        )
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != StreamStatus::Done
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamStatus::Starting => "starting",
            StreamStatus::Running => "running",
            StreamStatus::Terminate => "terminate",
            StreamStatus::Done => "done",
            StreamStatus::ProtocolMismatch => "protocol mismatch",
            StreamStatus::IoFailure => "I/O failure",
            StreamStatus::BlocksBufferFull => "blocks buffer full",
            StreamStatus::SamplesBufferFull => "samples buffer full",
            StreamStatus::GainChangesBufferFull => "gain changes buffer full",
            StreamStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Monotonic run status readable from any thread without locking.
#[derive(Debug)]
pub struct SharedStatus {
    value: AtomicU8,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStatus {
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(StreamStatus::Starting as u8),
        }
    }

    pub fn load(&self) -> StreamStatus {
        StreamStatus::from_u8(self.value.load(Ordering::Relaxed))
    }

    pub fn is_streaming(&self) -> bool {
        self.load().is_streaming()
    }

    fn transition(&self, from: StreamStatus, to: StreamStatus) -> bool {
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Starting -> Running. Returns false if streaming already started or ended.
    pub fn start(&self) -> bool {
        self.transition(StreamStatus::Starting, StreamStatus::Running)
    }

    /// Running -> Terminate, exactly once. Later requests are ignored.
    pub fn request_terminate(&self) -> bool {
        self.transition(StreamStatus::Running, StreamStatus::Terminate)
    }

    /// Marks the end of stream. Only valid from a streaming state.
    pub fn finish(&self) -> bool {
        self.value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                StreamStatus::from_u8(current)
                    .is_streaming()
                    .then_some(StreamStatus::Done as u8)
            })
            .is_ok()
    }

    /// Moves to a failure status unless the session already ended.
    /// The first failure wins.
    pub fn fail(&self, failure: StreamStatus) -> bool {
        debug_assert!(failure.is_failure());
        self.value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (!StreamStatus::from_u8(current).is_terminal()).then_some(failure as u8)
            })
            .is_ok()
    }
}
