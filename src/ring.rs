//! Fixed-capacity circular buffers shared between the device callback
//! threads (producers) and the writer thread (consumer).
//!
//! Every ring keeps its cursors and counters behind one mutex. Producers
//! never wait for space: admission is a non-blocking try that either
//! succeeds or reports the ring as full. The consumer is the only party
//! allowed to block, waiting on the ring's "ready" count.
//!
//! Two usage modes exist:
//! - [`BoundedRing`]: push/pop of whole records under the lock (block
//!   descriptors, gain changes);
//! - [`SampleRing`]: reserve a region, fill it outside the lock, and later
//!   read it back through the offset carried by a block descriptor.

use std::fmt;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::status::SharedStatus;

/// Receiver channel (tuner) a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum ChannelId {
    #[default]
    A,
    B,
}

impl ChannelId {
    pub fn index(self) -> usize {
        match self {
            ChannelId::A => 0,
            ChannelId::B => 1,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::A => f.write_str("A"),
            ChannelId::B => f.write_str("B"),
        }
    }
}

/// One hardware callback worth of samples, already copied into the sample
/// ring as an I run followed by a Q run of the same length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockDescriptor {
    pub first_sample_num: u32,
    /// Zero marks the end of the channel's stream.
    pub num_samples: u32,
    pub samples_offset: u32,
    pub channel: ChannelId,
}

impl BlockDescriptor {
    /// End-of-stream marker for `channel`.
    pub fn sentinel(channel: ChannelId, first_sample_num: u32) -> Self {
        Self {
            first_sample_num,
            num_samples: 0,
            samples_offset: 0,
            channel,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.num_samples == 0
    }

    /// Sample ring index of the first I value.
    pub fn i_start(&self) -> usize {
        self.samples_offset as usize
    }

    /// Sample ring index of the first Q value (before wrapping).
    pub fn q_start(&self) -> usize {
        self.samples_offset as usize + self.num_samples as usize
    }
}

/// A region handed out by [`SampleRing::try_reserve_write`]. It borrows
/// the ring it came from and is the only way to write into it.
pub struct Reservation<'a> {
    ring: &'a SampleRing,
    offset: usize,
    len: usize,
}

impl Reservation<'_> {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `parts` back to back into the region, wrapping at the end of
    /// storage, and returns the region's starting index. The values become
    /// visible to the consumer once that index is published under a lock
    /// (the block ring push).
    pub fn fill(self, parts: &[&[i16]]) -> usize {
        let total: usize = parts.iter().map(|part| part.len()).sum();
        assert!(total <= self.len, "fill exceeds reservation");
        let capacity = self.ring.capacity();
        for (k, &value) in parts.iter().flat_map(|part| part.iter()).enumerate() {
            self.ring.slots[(self.offset + k) % capacity].store(value, Ordering::Relaxed);
        }
        self.offset
    }
}

impl fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Occupancy snapshot, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingUsage {
    pub capacity: usize,
    pub in_use: usize,
    pub in_use_max: usize,
    pub ready: usize,
}

#[derive(Debug, Default)]
struct Cursors {
    read_index: usize,
    write_index: usize,
    in_use: usize,
    in_use_max: usize,
    ready: usize,
}

impl Cursors {
    fn admit(&mut self, n: usize, capacity: usize) -> Option<usize> {
        if self.in_use + n > capacity {
            return None;
        }
        let offset = self.write_index;
        self.write_index = (self.write_index + n) % capacity;
        self.in_use += n;
        self.in_use_max = self.in_use_max.max(self.in_use);
        Some(offset)
    }

    fn release(&mut self, n: usize) {
        debug_assert!(n <= self.in_use, "releasing more than in use");
        self.in_use = self.in_use.saturating_sub(n);
    }

    fn usage(&self, capacity: usize) -> RingUsage {
        RingUsage {
            capacity,
            in_use: self.in_use,
            in_use_max: self.in_use_max,
            ready: self.ready,
        }
    }
}

fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RecordState<T> {
    cursors: Cursors,
    slots: Box<[T]>,
}

/// FIFO of whole records (block descriptors, gain changes). Slots live
/// behind the same mutex as the cursors.
pub struct BoundedRing<T> {
    state: Mutex<RecordState<T>>,
    is_ready: Condvar,
    capacity: usize,
}

impl<T: Copy + Default> BoundedRing<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            state: Mutex::new(RecordState {
                cursors: Cursors::default(),
                slots: vec![T::default(); capacity].into_boxed_slice(),
            }),
            is_ready: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves, writes and commits one slot under a single lock, so ready
    /// slots always form a contiguous run starting at the read cursor even
    /// with several producers. Returns false when the ring is full.
    pub fn push(&self, value: T) -> bool {
        let mut state = lock(&self.state);
        let Some(index) = state.cursors.admit(1, self.capacity) else {
            return false;
        };
        state.slots[index] = value;
        state.cursors.ready += 1;
        drop(state);
        self.is_ready.notify_one();
        true
    }

    /// Blocks until at least `threshold` entries are ready or the session
    /// stops streaming. Returns whether the threshold was reached.
    pub fn wait_until_ready(&self, threshold: usize, status: &SharedStatus) -> bool {
        let state = lock(&self.state);
        let state = self
            .is_ready
            .wait_while(state, |state| state.cursors.ready < threshold && status.is_streaming())
            .unwrap_or_else(PoisonError::into_inner);
        state.cursors.ready >= threshold
    }

    /// Claims `n` ready entries if that many are available.
    pub fn take_ready(&self, n: usize) -> bool {
        let mut state = lock(&self.state);
        if state.cursors.ready < n {
            return false;
        }
        state.cursors.ready -= n;
        true
    }

    /// Claims every entry currently ready.
    pub fn take_all_ready(&self) -> usize {
        std::mem::take(&mut lock(&self.state).cursors.ready)
    }

    /// Copies up to `max` entries from the read cursor into `out`, stopping
    /// at the end of storage, and advances the cursor. Callers must have
    /// claimed those entries with `take_ready`/`take_all_ready`. The slots
    /// stay in use until [`release_read`](Self::release_read).
    pub fn pop_contiguous(&self, max: usize, out: &mut Vec<T>) -> usize {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let start = state.cursors.read_index;
        let n = max.min(self.capacity - start);
        out.extend_from_slice(&state.slots[start..start + n]);
        state.cursors.read_index = (start + n) % self.capacity;
        n
    }

    /// Pops the entry at the read cursor.
    pub fn pop(&self) -> T {
        let mut out = Vec::with_capacity(1);
        self.pop_contiguous(1, &mut out);
        out.pop().unwrap_or_default()
    }

    /// Returns `n` slots to the free pool once the consumer is done with
    /// them. Producers fail fast instead of waiting, so nobody is woken.
    pub fn release_read(&self, n: usize) {
        lock(&self.state).cursors.release(n);
    }

    /// Wakes a consumer blocked in `wait_until_ready` so it can re-check
    /// the session status.
    pub fn wake(&self) {
        let _state = lock(&self.state);
        self.is_ready.notify_all();
    }

    pub fn usage(&self) -> RingUsage {
        lock(&self.state).cursors.usage(self.capacity)
    }
}

/// Raw 16-bit sample storage. Producers reserve a region, fill it outside
/// the lock and publish its offset inside a block descriptor; the consumer
/// reads the region back and releases it once written out.
pub struct SampleRing {
    slots: Box<[AtomicI16]>,
    cursors: Mutex<Cursors>,
}

impl SampleRing {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            slots: (0..capacity).map(|_| AtomicI16::new(0)).collect(),
            cursors: Mutex::new(Cursors::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Admits `n` consecutive slots (wrapping at the end of storage) if
    /// they fit in the free space, without ever blocking. A request that
    /// does not fit is refused whole.
    pub fn try_reserve_write(&self, n: usize) -> Option<Reservation<'_>> {
        let offset = lock(&self.cursors).admit(n, self.capacity())?;
        Some(Reservation { ring: self, offset, len: n })
    }

    /// Iterates `len` values starting at `start`, wrapping at the end of
    /// storage.
    pub fn read_run(&self, start: usize, len: usize) -> impl Iterator<Item = i16> + '_ {
        let capacity = self.capacity();
        (start..start + len).map(move |index| self.slots[index % capacity].load(Ordering::Relaxed))
    }

    pub fn i_values(&self, block: &BlockDescriptor) -> impl Iterator<Item = i16> + '_ {
        self.read_run(block.i_start(), block.num_samples as usize)
    }

    pub fn q_values(&self, block: &BlockDescriptor) -> impl Iterator<Item = i16> + '_ {
        self.read_run(block.q_start(), block.num_samples as usize)
    }

    pub fn release_read(&self, n: usize) {
        lock(&self.cursors).release(n);
    }

    pub fn usage(&self) -> RingUsage {
        lock(&self.cursors).usage(self.capacity())
    }
}
