//! Producer side of the pipeline: runs inside the device's sample and
//! event callbacks.
//!
//! Nothing here ever blocks. A batch that does not fit in the rings fails
//! the whole session instead of waiting for the writer to catch up.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::buffers::StreamBuffers;
use crate::gains::GainChange;
use crate::ring::{BlockDescriptor, ChannelId};
use crate::sequence::SequenceTracker;
use crate::status::StreamStatus;
use crate::timeinfo::TimeTracker;

/// Per-channel diagnostics, collected while running.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub earliest_callback: Option<DateTime<Utc>>,
    pub latest_callback: Option<DateTime<Utc>>,
    pub total_samples: u64,
    /// Advisory count from this channel's own sequence numbers.
    pub dropped_samples: u64,
    pub num_samples_min: u32,
    pub num_samples_max: u32,
    pub imin: i16,
    pub imax: i16,
    pub qmin: i16,
    pub qmax: i16,
    pub gain_changes: u64,
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            earliest_callback: None,
            latest_callback: None,
            total_samples: 0,
            dropped_samples: 0,
            num_samples_min: u32::MAX,
            num_samples_max: 0,
            imin: i16::MAX,
            imax: i16::MIN,
            qmin: i16::MAX,
            qmax: i16::MIN,
            gain_changes: 0,
        }
    }
}

impl ChannelStats {
    /// True once at least one batch was accepted.
    pub fn has_samples(&self) -> bool {
        self.total_samples > 0
    }

    fn record_batch(&mut self, i: &[i16], q: &[i16], now: DateTime<Utc>) {
        let n = i.len() as u32;
        self.earliest_callback.get_or_insert(now);
        self.latest_callback = Some(now);
        self.total_samples += u64::from(n);
        self.num_samples_min = self.num_samples_min.min(n);
        self.num_samples_max = self.num_samples_max.max(n);

        if let Some((lo, hi)) = min_max(i) {
            self.imin = self.imin.min(lo);
            self.imax = self.imax.max(hi);
        }
        if let Some((lo, hi)) = min_max(q) {
            self.qmin = self.qmin.min(lo);
            self.qmax = self.qmax.max(hi);
        }
    }
}

fn min_max(values: &[i16]) -> Option<(i16, i16)> {
    values.iter().fold(None, |acc, &v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

/// State of one receiver channel on the producer side.
#[derive(Debug)]
pub struct ChannelContext {
    channel: ChannelId,
    sequence: SequenceTracker,
    stats: ChannelStats,
    timeinfo: Option<TimeTracker>,
    sentinel_sent: bool,
}

impl ChannelContext {
    /// The primary channel also keeps the session's wall-clock bookkeeping.
    pub fn primary(internal_decimation: u32, timeinfo: TimeTracker) -> Self {
        Self {
            timeinfo: Some(timeinfo),
            ..Self::secondary(ChannelId::A, internal_decimation)
        }
    }

    pub fn secondary(channel: ChannelId, internal_decimation: u32) -> Self {
        Self {
            channel,
            sequence: SequenceTracker::new(internal_decimation),
            stats: ChannelStats::default(),
            timeinfo: None,
            sentinel_sent: false,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn timeinfo(&self) -> Option<&TimeTracker> {
        self.timeinfo.as_ref()
    }

    pub fn sentinel_sent(&self) -> bool {
        self.sentinel_sent
    }

    /// Handles one hardware batch. `status` is the session status observed
    /// when the callback was entered.
    pub fn on_samples(
        &mut self,
        first_sample_num: u32,
        i: &[i16],
        q: &[i16],
        status: StreamStatus,
        buffers: &StreamBuffers,
        now: DateTime<Utc>,
    ) {
        if let Some(timeinfo) = self.timeinfo.as_mut() {
            timeinfo.update(self.stats.total_samples, status, now);
        }

        match status {
            StreamStatus::Terminate => {
                if !self.sentinel_sent {
                    self.close(first_sample_num, buffers);
                }
                return;
            }
            StreamStatus::Running => {}
            _ => return,
        }

        debug_assert_eq!(i.len(), q.len(), "I and Q runs differ in length");
        let n = i.len().min(q.len());
        if n == 0 {
            return;
        }
        let (i, q) = (&i[..n], &q[..n]);

        self.stats.record_batch(i, q, now);

        let dropped = self.sequence.gap_before(first_sample_num);
        if dropped > 0 {
            self.stats.dropped_samples += u64::from(dropped);
            debug!(channel = %self.channel, dropped, first_sample_num, "device dropped samples");
        }
        self.sequence.advance(first_sample_num, n as u32);

        self.enqueue(first_sample_num, i, q, buffers);
    }

    fn close(&mut self, first_sample_num: u32, buffers: &StreamBuffers) {
        let sentinel = BlockDescriptor::sentinel(self.channel, first_sample_num);
        if buffers.blocks.push(sentinel) {
            self.sentinel_sent = true;
            debug!(channel = %self.channel, "end of stream sent");
        } else {
            error!(channel = %self.channel, "blocks buffer full");
            buffers.fail(StreamStatus::BlocksBufferFull);
        }
    }

    fn enqueue(&mut self, first_sample_num: u32, i: &[i16], q: &[i16], buffers: &StreamBuffers) {
        let Some(reservation) = buffers.samples.try_reserve_write(2 * i.len()) else {
            error!(channel = %self.channel, requested = 2 * i.len(), "samples buffer full");
            buffers.fail(StreamStatus::SamplesBufferFull);
            return;
        };

        // Published to the writer by the descriptor pushed below
        let offset = reservation.fill(&[i, q]);

        let block = BlockDescriptor {
            first_sample_num,
            num_samples: i.len() as u32,
            samples_offset: offset as u32,
            channel: self.channel,
        };
        if !buffers.blocks.push(block) {
            error!(channel = %self.channel, "blocks buffer full");
            buffers.fail(StreamStatus::BlocksBufferFull);
        }
    }

    fn into_report(self) -> ChannelReport {
        ChannelReport {
            channel: self.channel,
            stats: self.stats,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    pub channel: ChannelId,
    pub stats: ChannelStats,
}

/// What the producer side leaves behind once the device has stopped.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub channels: Vec<ChannelReport>,
    pub timeinfo: TimeTracker,
}

/// Entry points a sample source calls, in the shape of a device driver's
/// stream and event callbacks.
pub struct DeviceCallbacks {
    buffers: Arc<StreamBuffers>,
    primary: ChannelContext,
    secondary: Option<ChannelContext>,
    last_primary_first: Option<u32>,
}

impl DeviceCallbacks {
    pub fn new(buffers: Arc<StreamBuffers>, dual_tuner: bool, internal_decimation: u32, timeinfo: TimeTracker) -> Self {
        Self {
            buffers,
            primary: ChannelContext::primary(internal_decimation, timeinfo),
            secondary: dual_tuner.then(|| ChannelContext::secondary(ChannelId::B, internal_decimation)),
            last_primary_first: None,
        }
    }

    pub fn is_dual_tuner(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn status(&self) -> StreamStatus {
        self.buffers.status.load()
    }

    /// One batch from one tuner.
    pub fn deliver_samples(&mut self, channel: ChannelId, first_sample_num: u32, i: &[i16], q: &[i16]) {
        let status = self.buffers.status.load();
        let now = Utc::now();
        match channel {
            ChannelId::A => {
                self.last_primary_first = Some(first_sample_num);
                self.primary.on_samples(first_sample_num, i, q, status, &self.buffers, now);
            }
            ChannelId::B => {
                let Some(secondary) = self.secondary.as_mut() else {
                    warn!("samples for tuner B in single tuner mode, ignored");
                    return;
                };
                if let Some(first_a) = self.last_primary_first {
                    if first_a != first_sample_num {
                        warn!(a = first_a, b = first_sample_num, "first sample number mismatch between tuners");
                    }
                }
                secondary.on_samples(first_sample_num, i, q, status, &self.buffers, now);
            }
        }
    }

    /// Both tuners of one hardware round. The status is read once so the
    /// two channels always take the same branch.
    pub fn deliver_pair(&mut self, first_sample_num: u32, a: (&[i16], &[i16]), b: (&[i16], &[i16])) {
        let status = self.buffers.status.load();
        let now = Utc::now();
        self.last_primary_first = Some(first_sample_num);
        self.primary.on_samples(first_sample_num, a.0, a.1, status, &self.buffers, now);
        match self.secondary.as_mut() {
            Some(secondary) => secondary.on_samples(first_sample_num, b.0, b.1, status, &self.buffers, now),
            None => warn!("paired delivery in single tuner mode, tuner B ignored"),
        }
    }

    /// A gain change reported by the device. Only recorded between start
    /// and the end of draining.
    pub fn deliver_gain_event(&mut self, tuner: ChannelId, current_gain: f32, gain_reduction_db: u8, lna_gain_reduction_db: u8) {
        let status = self.buffers.status.load();
        if !matches!(status, StreamStatus::Starting | StreamStatus::Running | StreamStatus::Terminate) {
            return;
        }

        let context = match (tuner, self.secondary.as_mut()) {
            (ChannelId::B, Some(secondary)) => secondary,
            _ => &mut self.primary,
        };
        let sample_num = if status == StreamStatus::Starting {
            0
        } else {
            context.stats.total_samples
        };
        context.stats.gain_changes += 1;
        let tuner_index = context.channel.index() as u8;

        let Some(gain_changes) = self.buffers.gain_changes.as_ref() else {
            return;
        };
        let event = GainChange::new(sample_num, current_gain, tuner_index, gain_reduction_db, lna_gain_reduction_db);
        if !gain_changes.try_push(event) {
            error!("gain changes buffer full");
            self.buffers.fail(StreamStatus::GainChangesBufferFull);
        }
    }

    /// Whether the source should keep calling back. After a termination
    /// request this stays true until every channel has closed its stream.
    pub fn wants_more(&self) -> bool {
        match self.buffers.status.load() {
            StreamStatus::Starting | StreamStatus::Running => true,
            StreamStatus::Terminate => {
                !self.primary.sentinel_sent() || self.secondary.as_ref().is_some_and(|s| !s.sentinel_sent())
            }
            _ => false,
        }
    }

    /// Asks the session to wind down, as a device would on end of input.
    pub fn request_terminate(&self) -> bool {
        self.buffers.request_terminate()
    }

    pub fn into_report(self) -> IngestReport {
        let mut primary = self.primary;
        let timeinfo = primary.timeinfo.take().unwrap_or_else(|| TimeTracker::new(0, 0));
        let mut channels = vec![primary.into_report()];
        channels.extend(self.secondary.map(ChannelContext::into_report));
        IngestReport { channels, timeinfo }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferCapacities;
    use chrono::TimeZone;

    fn buffers(blocks: usize, samples: usize) -> Arc<StreamBuffers> {
        Arc::new(StreamBuffers::new(&BufferCapacities {
            blocks,
            samples,
            gain_changes: Some(4),
        }))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn pop_block(buffers: &StreamBuffers) -> BlockDescriptor {
        assert!(buffers.blocks.take_ready(1));
        buffers.blocks.pop()
    }

    #[test]
    fn test_batches_dropped_until_running() {
        let buffers = buffers(4, 64);
        let mut ctx = ChannelContext::secondary(ChannelId::A, 1);
        ctx.on_samples(0, &[1, 2], &[3, 4], StreamStatus::Starting, &buffers, at(0));
        assert_eq!(buffers.blocks.usage().ready, 0);
        assert!(!ctx.stats().has_samples());
    }

    #[test]
    fn test_running_batch_is_copied() {
        let buffers = buffers(4, 64);
        let mut ctx = ChannelContext::secondary(ChannelId::A, 1);
        ctx.on_samples(10, &[1, -2, 3], &[4, 5, -6], StreamStatus::Running, &buffers, at(0));

        let block = pop_block(&buffers);
        assert_eq!(block.first_sample_num, 10);
        assert_eq!(block.num_samples, 3);
        assert_eq!(block.channel, ChannelId::A);
        let values: Vec<i16> = buffers.samples.read_run(block.i_start(), 6).collect();
        assert_eq!(values, vec![1, -2, 3, 4, 5, -6]);
        assert_eq!(buffers.samples.usage().in_use, 6);

        let stats = ctx.stats();
        assert_eq!(stats.total_samples, 3);
        assert_eq!((stats.imin, stats.imax), (-2, 3));
        assert_eq!((stats.qmin, stats.qmax), (-6, 5));
        assert_eq!((stats.num_samples_min, stats.num_samples_max), (3, 3));
    }

    #[test]
    fn test_dropped_samples_are_advisory() {
        let buffers = buffers(4, 64);
        let mut ctx = ChannelContext::secondary(ChannelId::A, 1);
        ctx.on_samples(0, &[0; 4], &[0; 4], StreamStatus::Running, &buffers, at(0));
        ctx.on_samples(10, &[0; 4], &[0; 4], StreamStatus::Running, &buffers, at(1));
        assert_eq!(ctx.stats().dropped_samples, 6);
        // Both batches still reach the writer
        assert_eq!(buffers.blocks.usage().ready, 2);
    }

    #[test]
    fn test_samples_buffer_full_is_fatal() {
        let buffers = buffers(4, 7);
        buffers.status.start();
        let mut ctx = ChannelContext::secondary(ChannelId::A, 1);
        ctx.on_samples(0, &[0; 4], &[0; 4], StreamStatus::Running, &buffers, at(0));
        assert_eq!(buffers.status.load(), StreamStatus::SamplesBufferFull);
        assert_eq!(buffers.blocks.usage().ready, 0);
    }

    #[test]
    fn test_blocks_buffer_full_is_fatal() {
        let buffers = buffers(1, 64);
        buffers.status.start();
        let mut ctx = ChannelContext::secondary(ChannelId::A, 1);
        ctx.on_samples(0, &[0; 2], &[0; 2], StreamStatus::Running, &buffers, at(0));
        ctx.on_samples(2, &[0; 2], &[0; 2], StreamStatus::Running, &buffers, at(0));
        assert_eq!(buffers.status.load(), StreamStatus::BlocksBufferFull);
    }

    #[test]
    fn test_exactly_one_sentinel_per_channel() {
        let buffers = buffers(4, 64);
        let mut ctx = ChannelContext::secondary(ChannelId::B, 1);
        ctx.on_samples(100, &[1; 8], &[1; 8], StreamStatus::Terminate, &buffers, at(0));
        ctx.on_samples(108, &[1; 8], &[1; 8], StreamStatus::Terminate, &buffers, at(0));
        assert!(ctx.sentinel_sent());

        assert_eq!(buffers.blocks.usage().ready, 1);
        let block = pop_block(&buffers);
        assert!(block.is_sentinel());
        assert_eq!(block.channel, ChannelId::B);
        assert_eq!(block.first_sample_num, 100);
        assert_eq!(buffers.samples.usage().in_use, 0);
    }

    #[test]
    fn test_primary_keeps_time() {
        let buffers = buffers(8, 64);
        let mut ctx = ChannelContext::primary(1, TimeTracker::new(1, 10));
        ctx.on_samples(0, &[0; 2], &[0; 2], StreamStatus::Running, &buffers, at(0));
        ctx.on_samples(2, &[0; 2], &[0; 2], StreamStatus::Running, &buffers, at(1));
        ctx.on_samples(4, &[0; 2], &[0; 2], StreamStatus::Terminate, &buffers, at(2));

        let timeinfo = ctx.timeinfo().unwrap();
        assert_eq!(timeinfo.start(), Some(at(0)));
        assert_eq!(timeinfo.stop(), Some(at(2)));
        // Marker sample numbers count samples before the batch
        let markers: Vec<u64> = timeinfo.markers().iter().map(|m| m.sample_num).collect();
        assert_eq!(markers, vec![0, 2]);
    }

    #[test]
    fn test_gain_event_sample_numbers() {
        let buffers = buffers(8, 64);
        let mut callbacks = DeviceCallbacks::new(Arc::clone(&buffers), true, 1, TimeTracker::new(0, 0));

        callbacks.deliver_gain_event(ChannelId::A, 40.0, 20, 0);
        buffers.status.start();
        callbacks.deliver_pair(0, (&[0; 5], &[0; 5]), (&[0; 5], &[0; 5]));
        callbacks.deliver_gain_event(ChannelId::B, 41.5, 21, 3);

        let mut sink = Vec::new();
        let gains = buffers.gain_changes.as_ref().unwrap();
        assert_eq!(gains.drain_to(&mut sink).unwrap(), 2);
        let first = GainChange::from_bytes(&sink[..16]).unwrap();
        let second = GainChange::from_bytes(&sink[16..]).unwrap();
        assert_eq!((first.sample_num, first.tuner), (0, 0));
        assert_eq!((second.sample_num, second.tuner), (5, 1));
        assert_eq!(second.gain_reduction_db, 21);

        let report = callbacks.into_report();
        assert_eq!(report.channels[0].stats.gain_changes, 1);
        assert_eq!(report.channels[1].stats.gain_changes, 1);
    }

    #[test]
    fn test_gain_changes_buffer_full() {
        let buffers = buffers(8, 64);
        buffers.status.start();
        let mut callbacks = DeviceCallbacks::new(Arc::clone(&buffers), false, 1, TimeTracker::new(0, 0));
        for _ in 0..5 {
            callbacks.deliver_gain_event(ChannelId::A, 40.0, 20, 0);
        }
        assert_eq!(buffers.status.load(), StreamStatus::GainChangesBufferFull);
    }

    #[test]
    fn test_wants_more_until_all_closed() {
        let buffers = buffers(8, 64);
        let mut callbacks = DeviceCallbacks::new(Arc::clone(&buffers), true, 1, TimeTracker::new(0, 0));
        assert!(callbacks.wants_more());
        buffers.status.start();
        assert!(callbacks.request_terminate());
        assert!(callbacks.wants_more());

        callbacks.deliver_samples(ChannelId::A, 0, &[0; 2], &[0; 2]);
        assert!(callbacks.wants_more());
        callbacks.deliver_samples(ChannelId::B, 0, &[0; 2], &[0; 2]);
        assert!(!callbacks.wants_more());
        assert_eq!(buffers.blocks.usage().ready, 2);
    }
}
