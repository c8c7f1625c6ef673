//! Signal generator standing in for tuner hardware.

use std::f64::consts::TAU;

use tracing::{debug, info};

use super::{DeviceInfo, Pacer, SampleSource, SourceError};
use crate::config::SourceConfig;
use crate::ingest::DeviceCallbacks;
use crate::ring::ChannelId;
use crate::sequence::next_expected_sample_num;

const BASE_GAIN_REDUCTION_DB: u8 = 20;
const GAIN_STEP_DB: u8 = 6;
const LNA_GAIN_REDUCTION_DB: u8 = 3;

/// Produces a complex tone in fixed-size blocks. Tuner B, when enabled,
/// carries the mirror image of the tone.
pub struct SyntheticSource {
    info: DeviceInfo,
    block_size: usize,
    realtime: bool,
    phase_step: f64,
    amplitude: f64,
    gain_change_every: u32,
    drop_every: u32,
    block_limit: Option<u64>,
}

impl SyntheticSource {
    pub fn new(info: DeviceInfo, block_size: usize, config: &SourceConfig) -> Self {
        Self {
            phase_step: TAU * config.tone_hz / info.output_sample_rate,
            amplitude: f64::from(config.amplitude),
            info,
            block_size,
            realtime: config.realtime,
            gain_change_every: config.gain_change_every,
            drop_every: 0,
            block_limit: None,
        }
    }

    /// Stops after `blocks` blocks as if the device had run dry.
    pub fn with_block_limit(mut self, blocks: u64) -> Self {
        self.block_limit = Some(blocks);
        self
    }

    /// Skips every `every`-th block while still advancing the sample
    /// counter, like a lost USB transfer.
    pub fn with_dropped_blocks(mut self, every: u32) -> Self {
        self.drop_every = every;
        self
    }

    fn fill(&self, start_phase: f64, i: &mut [i16], q: &mut [i16]) {
        for (k, (i, q)) in i.iter_mut().zip(q.iter_mut()).enumerate() {
            let phase = start_phase + self.phase_step * k as f64;
            *i = (self.amplitude * phase.cos()).round() as i16;
            *q = (self.amplitude * phase.sin()).round() as i16;
        }
    }
}

impl SampleSource for SyntheticSource {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn run(&mut self, callbacks: &mut DeviceCallbacks) -> Result<(), SourceError> {
        if self.block_size == 0 {
            return Err(SourceError::Invalid("block size must be positive".into()));
        }
        let n = self.block_size;
        let num_samples = n as u32;
        let mut i = vec![0i16; n];
        let mut q = vec![0i16; n];
        let mut q_mirror = vec![0i16; n];
        let pacer = Pacer::new(self.realtime, n, self.info.output_sample_rate);

        info!(
            sample_rate = self.info.output_sample_rate,
            block_size = n,
            dual_tuner = self.info.dual_tuner,
            "synthetic source started"
        );

        let mut first_sample_num = 0u32;
        let mut phase = 0.0f64;
        let mut blocks = 0u64;
        let mut gain_stepped = false;

        while callbacks.wants_more() {
            if self.block_limit.is_some_and(|limit| blocks >= limit) && callbacks.request_terminate() {
                debug!(blocks, "block limit reached");
            }

            self.fill(phase, &mut i, &mut q);
            let dropped = self.drop_every > 0 && blocks > 0 && blocks % u64::from(self.drop_every) == 0;
            if dropped {
                debug!(first_sample_num, "dropping block");
            } else if self.info.dual_tuner {
                for (m, q) in q_mirror.iter_mut().zip(&q) {
                    *m = q.saturating_neg();
                }
                callbacks.deliver_pair(first_sample_num, (&i, &q), (&i, &q_mirror));
            } else {
                callbacks.deliver_samples(ChannelId::A, first_sample_num, &i, &q);
            }

            if self.gain_change_every > 0 && blocks > 0 && blocks % u64::from(self.gain_change_every) == 0 {
                gain_stepped = !gain_stepped;
                let (gain, gr) = if gain_stepped {
                    (self.info.gain_a - f32::from(GAIN_STEP_DB), BASE_GAIN_REDUCTION_DB + GAIN_STEP_DB)
                } else {
                    (self.info.gain_a, BASE_GAIN_REDUCTION_DB)
                };
                callbacks.deliver_gain_event(ChannelId::A, gain, gr, LNA_GAIN_REDUCTION_DB);
            }

            phase = (phase + self.phase_step * n as f64) % TAU;
            first_sample_num = next_expected_sample_num(first_sample_num, num_samples, self.info.internal_decimation);
            blocks += 1;
            pacer.wait_for_block(blocks);
        }

        debug!(blocks, "synthetic source stopped");
        Ok(())
    }
}
