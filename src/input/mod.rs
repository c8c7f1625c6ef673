pub mod file;
pub mod synthetic;

pub use file::FileSource;
pub use synthetic::SyntheticSource;

use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::RecorderConfig;
use crate::ingest::DeviceCallbacks;
use crate::output::ContainerInfo;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open input {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("Input read error: {0}")]
    Read(#[from] io::Error),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// What the device reports about the stream it is about to deliver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceInfo {
    pub output_sample_rate: f64,
    pub internal_decimation: u32,
    pub dual_tuner: bool,
    pub frequency_a: f64,
    pub frequency_b: f64,
    pub gain_a: f32,
    pub gain_b: Option<f32>,
}

impl DeviceInfo {
    pub fn from_config(config: &RecorderConfig) -> Self {
        let dual_tuner = config.stream.dual_tuner;
        Self {
            output_sample_rate: config.output_sample_rate(),
            internal_decimation: config.stream.internal_decimation,
            dual_tuner,
            frequency_a: config.source.frequency_a,
            frequency_b: config.source.frequency_b(),
            gain_a: config.source.gain_db,
            gain_b: dual_tuner.then_some(config.source.gain_db),
        }
    }

    pub fn container_info(&self, marker_capacity: usize) -> ContainerInfo {
        ContainerInfo {
            dual_tuner: self.dual_tuner,
            sample_rate: self.output_sample_rate,
            frequency_a: self.frequency_a,
            frequency_b: self.frequency_b,
            gain_a: self.gain_a,
            gain_b: self.gain_b,
            marker_capacity,
        }
    }
}

/// A device delivering sample batches and gain events through
/// [`DeviceCallbacks`] until the session no longer wants them.
pub trait SampleSource: Send {
    fn info(&self) -> DeviceInfo;

    fn run(&mut self, callbacks: &mut DeviceCallbacks) -> Result<(), SourceError>;
}

/// Builds the source selected by the configuration: replay of a raw
/// recording when an input file is set, otherwise the signal generator.
pub fn from_config(config: &RecorderConfig) -> Result<Box<dyn SampleSource>, SourceError> {
    let info = DeviceInfo::from_config(config);
    let block_size = config.source.block_size as usize;
    match &config.source.input {
        Some(path) => Ok(Box::new(FileSource::open(path, info, block_size, config.source.realtime)?)),
        None => Ok(Box::new(SyntheticSource::new(info, block_size, &config.source))),
    }
}

/// Sleeps so that block `n` is not delivered before its due time.
#[derive(Debug, Clone, Copy)]
struct Pacer {
    started: Instant,
    period: Option<Duration>,
}

impl Pacer {
    fn new(realtime: bool, block_size: usize, sample_rate: f64) -> Self {
        let period = (realtime && sample_rate > 0.0).then(|| Duration::from_secs_f64(block_size as f64 / sample_rate));
        Self {
            started: Instant::now(),
            period,
        }
    }

    fn wait_for_block(&self, n: u64) {
        let Some(period) = self.period else {
            return;
        };
        let due = self.started + period.mul_f64(n as f64);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
    }
}
