//! Consumer side of the pipeline: the single thread that turns block
//! descriptors back into one interleaved, gap-aware output stream.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::buffers::StreamBuffers;
use crate::ring::{BlockDescriptor, ChannelId};
use crate::sequence::SequenceTracker;
use crate::status::StreamStatus;

/// Why a session ended without reaching the end of stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("blocks buffer full")]
    BlocksBufferFull,
    #[error("samples buffer full")]
    SamplesBufferFull,
    #[error("gain changes buffer full")]
    GainChangesBufferFull,
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("write failed")]
    Io(#[from] io::Error),
    #[error("sample source failed")]
    SourceFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    pub dual_tuner: bool,
    pub internal_decimation: u32,
    /// Largest gap, in samples, that is filled with zeros.
    pub zero_fill_max: u32,
}

impl WriterSettings {
    fn channels(&self) -> usize {
        if self.dual_tuner {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Bytes that reached the output sink.
    pub data_size: u64,
    /// Output frames, zero fill included.
    pub output_samples: u64,
    pub zero_filled_samples: u64,
    pub gaps_filled: u64,
    pub gaps_skipped: u64,
    pub total_writes: u64,
    pub total_write_elapsed: Duration,
    pub max_write_elapsed: Duration,
    pub full_writes: u64,
    pub partial_writes: u64,
    pub zero_writes: u64,
}

impl WriteStats {
    pub fn average_write_elapsed(&self) -> Duration {
        match u32::try_from(self.total_writes) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_write_elapsed / n,
            Err(_) => Duration::from_secs_f64(self.total_write_elapsed.as_secs_f64() / self.total_writes as f64),
        }
    }
}

/// Writes `buf` completely, one `write` call at a time, keeping timing and
/// short-write statistics. Interrupted calls are retried and not counted.
fn write_counted<W: Write>(sink: &mut W, stats: &mut WriteStats, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let started = Instant::now();
        let result = sink.write(buf);
        let elapsed = started.elapsed();

        let written = match result {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        stats.total_writes += 1;
        stats.total_write_elapsed += elapsed;
        stats.max_write_elapsed = stats.max_write_elapsed.max(elapsed);
        if written == buf.len() {
            stats.full_writes += 1;
        } else if written == 0 {
            stats.zero_writes += 1;
        } else {
            stats.partial_writes += 1;
        }
        stats.data_size += written as u64;
        buf = &buf[written..];
    }
    Ok(())
}

pub struct StreamWriter<W, G = io::Sink> {
    buffers: Arc<StreamBuffers>,
    settings: WriterSettings,
    output: W,
    gains: Option<G>,
    sequence: SequenceTracker,
    frame: Vec<i16>,
    stats: WriteStats,
    io_error: Option<io::Error>,
    mismatch: Option<String>,
}

impl<W: Write, G: Write> StreamWriter<W, G> {
    pub fn new(buffers: Arc<StreamBuffers>, settings: WriterSettings, output: W, gains: Option<G>) -> Self {
        let frame = Vec::with_capacity(buffers.samples.capacity());
        Self {
            sequence: SequenceTracker::new(settings.internal_decimation),
            buffers,
            settings,
            output,
            gains,
            frame,
            stats: WriteStats::default(),
            io_error: None,
            mismatch: None,
        }
    }

    pub fn stats(&self) -> &WriteStats {
        &self.stats
    }

    /// Consumes blocks until every channel has closed its stream or the
    /// session fails. Returns once the status is no longer streaming.
    pub fn run(&mut self) -> Result<(), StreamError> {
        let nrx = self.settings.channels();
        let buffers = Arc::clone(&self.buffers);
        let status = &buffers.status;
        status.start();

        while status.is_streaming() {
            if buffers.blocks.wait_until_ready(nrx, status) {
                while buffers.blocks.take_ready(nrx) {
                    self.consume_set();
                    if !status.is_streaming() {
                        break;
                    }
                }
            }
            self.drain_gain_changes();
        }

        if let Err(e) = self.output.flush() {
            self.record_io_error("flush output", e);
        }
        if let Some(gains) = self.gains.as_mut() {
            if let Err(e) = gains.flush() {
                self.io_error.get_or_insert(e);
            }
        }

        self.outcome(status.load())
    }

    fn outcome(&mut self, status: StreamStatus) -> Result<(), StreamError> {
        match status {
            StreamStatus::Done => match self.io_error.take() {
                Some(e) => Err(StreamError::Io(e)),
                None => Ok(()),
            },
            StreamStatus::BlocksBufferFull => Err(StreamError::BlocksBufferFull),
            StreamStatus::SamplesBufferFull => Err(StreamError::SamplesBufferFull),
            StreamStatus::GainChangesBufferFull => Err(StreamError::GainChangesBufferFull),
            StreamStatus::ProtocolMismatch => Err(StreamError::ProtocolMismatch(
                self.mismatch.take().unwrap_or_else(|| "unknown".to_string()),
            )),
            StreamStatus::IoFailure => Err(StreamError::Io(
                self.io_error.take().unwrap_or_else(|| io::Error::other("write failed")),
            )),
            _ => Err(StreamError::SourceFailed),
        }
    }

    /// Pops one matched set of descriptors, writes it and hands its slots
    /// back to the producers whatever happened.
    fn consume_set(&mut self) {
        let a = self.buffers.blocks.pop();
        let b = self.settings.dual_tuner.then(|| self.buffers.blocks.pop());

        let result = self.write_set(&a, b.as_ref());

        let consumed = a.num_samples as usize + b.map_or(0, |b| b.num_samples as usize);
        self.buffers.blocks.release_read(self.settings.channels());
        if consumed > 0 {
            self.buffers.samples.release_read(2 * consumed);
        }

        if let Err(failure) = result {
            self.buffers.fail(failure);
        }
    }

    fn validate(&self, a: &BlockDescriptor, b: Option<&BlockDescriptor>) -> Result<(), String> {
        match b {
            None if a.channel != ChannelId::A => Err(format!("invalid channel {}", a.channel)),
            None => Ok(()),
            Some(b) if a.channel != ChannelId::A || b.channel != ChannelId::B => {
                Err(format!("channel mismatch - {} {}", a.channel, b.channel))
            }
            Some(b) if a.first_sample_num != b.first_sample_num => Err(format!(
                "first_sample_num mismatch - {} {}",
                a.first_sample_num, b.first_sample_num
            )),
            Some(b) if a.num_samples != b.num_samples => {
                Err(format!("num_samples mismatch - {} {}", a.num_samples, b.num_samples))
            }
            Some(_) => Ok(()),
        }
    }

    fn write_set(&mut self, a: &BlockDescriptor, b: Option<&BlockDescriptor>) -> Result<(), StreamStatus> {
        if let Err(detail) = self.validate(a, b) {
            error!("{detail}");
            self.mismatch.get_or_insert(detail);
            return Err(StreamStatus::ProtocolMismatch);
        }

        if a.is_sentinel() {
            debug!("end of stream");
            self.buffers.status.finish();
            return Ok(());
        }

        let first_sample_num = a.first_sample_num;
        let num_samples = a.num_samples;

        let dropped = self.sequence.gap_before(first_sample_num);
        if dropped > 0 {
            let fill = dropped <= self.settings.zero_fill_max;
            warn!(
                next_sample_num = self.sequence.expected().unwrap_or_default(),
                first_sample_num,
                "dropped {dropped} samples - {}",
                if fill { "filling gap with zeros" } else { "skipping gap" }
            );
            if fill {
                self.frame.clear();
                self.frame.resize(dropped as usize * 2 * self.settings.channels(), 0);
                self.write_frame()?;
                self.stats.output_samples += u64::from(dropped);
                self.stats.zero_filled_samples += u64::from(dropped);
                self.stats.gaps_filled += 1;
            } else {
                self.stats.gaps_skipped += 1;
            }
        }
        self.sequence.advance(first_sample_num, num_samples);

        self.interleave(a, b);
        self.write_frame()?;
        self.stats.output_samples += u64::from(num_samples);
        Ok(())
    }

    /// `[I_A, Q_A]` per frame, or `[I_A, Q_A, I_B, Q_B]` with two tuners.
    fn interleave(&mut self, a: &BlockDescriptor, b: Option<&BlockDescriptor>) {
        let n = a.num_samples as usize;
        let stride = 2 * self.settings.channels();
        self.frame.clear();
        self.frame.resize(n * stride, 0);

        let samples = &self.buffers.samples;
        let runs = [Some(a), b].into_iter().flatten().flat_map(|block| [block.i_start(), block.q_start()]);
        for (lane, start) in runs.enumerate() {
            for (value, sample) in self.frame[lane..].iter_mut().step_by(stride).zip(samples.read_run(start, n)) {
                *value = sample;
            }
        }
    }

    fn write_frame(&mut self) -> Result<(), StreamStatus> {
        let bytes: &[u8] = bytemuck::cast_slice(&self.frame);
        if let Err(e) = write_counted(&mut self.output, &mut self.stats, bytes) {
            self.record_io_error("write samples", e);
            return Err(StreamStatus::IoFailure);
        }
        Ok(())
    }

    fn drain_gain_changes(&mut self) {
        let (Some(gains), Some(channel)) = (self.gains.as_mut(), self.buffers.gain_changes.as_ref()) else {
            return;
        };
        match channel.drain_to(gains) {
            Ok(0) => {}
            Ok(n) => debug!(count = n, "gain changes written"),
            Err(e) => {
                self.record_io_error("write gains", e);
                self.buffers.fail(StreamStatus::IoFailure);
            }
        }
    }

    fn record_io_error(&mut self, what: &str, e: io::Error) {
        error!("{what} failed: {e}");
        self.io_error.get_or_insert(e);
    }

    /// Hands back the sinks once the run is over, for container finalizing.
    pub fn into_parts(self) -> (W, Option<G>, WriteStats) {
        (self.output, self.gains, self.stats)
    }
}
