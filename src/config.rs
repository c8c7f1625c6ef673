//! Recorder configuration: an optional TOML file, overridden by the command
//! line, validated once before any buffer is allocated.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffers::BufferCapacities;
use crate::writer::WriterSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Container written around the sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// Samples only
    #[default]
    Raw,
    Linrad,
    /// RIFF, promoted to RF64 when needed
    Wav,
}

impl OutputType {
    pub fn default_template(self) -> &'static str {
        match self {
            OutputType::Raw => "RSP_recording_{TIMESTAMP}_{FREQKHZ}.iq",
            OutputType::Linrad => "RSP_recording_{TIMESTAMP}_{FREQKHZ}.raw",
            OutputType::Wav => "RSP_recording_{TIMESTAMP}_{FREQHZ}.wav",
        }
    }

    /// Whether the container can be written to a sink that cannot seek.
    pub fn is_streamable(self) -> bool {
        !matches!(self, OutputType::Wav)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Seconds to record; 0 records until interrupted or the input ends.
    pub streaming_time_secs: u32,
    /// Store a time marker every N seconds (WAV only); 0 disables markers.
    pub marker_interval_secs: u32,
    /// Gaps up to this many samples are filled with zeros.
    pub zero_fill_max_samples: u32,
    pub dual_tuner: bool,
    pub internal_decimation: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            streaming_time_secs: 10,
            marker_interval_secs: 0,
            zero_fill_max_samples: 100_000,
            dual_tuner: false,
            internal_decimation: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Block descriptors
    pub blocks: usize,
    /// 16-bit values
    pub samples: usize,
    pub gain_changes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            blocks: 2000,
            samples: 1_048_576,
            gain_changes: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(rename = "type")]
    pub output_type: OutputType,
    /// Filename template; `-` is stdout and `|name` a named pipe.
    pub filename: Option<String>,
    pub gains_file: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Device sample rate in Hz, before any decimation.
    pub sample_rate: f64,
    /// Software decimation applied by the device.
    pub decimation: u32,
    pub frequency_a: f64,
    /// Defaults to `frequency_a`.
    pub frequency_b: Option<f64>,
    /// Replay this raw recording instead of generating a signal.
    pub input: Option<PathBuf>,
    pub block_size: u32,
    /// Pace delivery at the output sample rate.
    pub realtime: bool,
    /// Synthetic tone offset from the center frequency.
    pub tone_hz: f64,
    pub amplitude: i16,
    pub gain_db: f32,
    /// Emit a gain change every N blocks; 0 never does.
    pub gain_change_every: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 2_000_000.0,
            decimation: 1,
            frequency_a: 100e6,
            frequency_b: None,
            input: None,
            block_size: 1008,
            realtime: true,
            tone_hz: 10_000.0,
            amplitude: 8192,
            gain_db: 40.0,
            gain_change_every: 0,
        }
    }
}

impl SourceConfig {
    pub fn frequency_b(&self) -> f64 {
        self.frequency_b.unwrap_or(self.frequency_a)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub stream: StreamConfig,
    pub buffers: BufferConfig,
    pub output: OutputConfig,
    pub source: SourceConfig,
}

impl RecorderConfig {
    /// Reads a config file. Missing keys keep their defaults; the result is
    /// not validated yet since command-line flags may still override it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// The output filename template, falling back to the default for the
    /// selected container.
    pub fn filename_template(&self) -> &str {
        self.output
            .filename
            .as_deref()
            .unwrap_or_else(|| self.output.output_type.default_template())
    }

    pub fn output_sample_rate(&self) -> f64 {
        self.source.sample_rate
            / f64::from(self.stream.internal_decimation.max(1))
            / f64::from(self.source.decimation.max(1))
    }

    pub fn capacities(&self) -> BufferCapacities {
        BufferCapacities {
            blocks: self.buffers.blocks,
            samples: self.buffers.samples,
            gain_changes: self.output.gains_file.then_some(self.buffers.gain_changes),
        }
    }

    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            dual_tuner: self.stream.dual_tuner,
            internal_decimation: self.stream.internal_decimation,
            zero_fill_max: self.stream.zero_fill_max_samples,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: String) -> Result<(), ConfigError> {
            Err(ConfigError::Validation(msg))
        }

        if self.buffers.blocks == 0 || self.buffers.samples == 0 {
            return invalid("buffer capacities must be positive".into());
        }
        if self.output.gains_file && self.buffers.gain_changes == 0 {
            return invalid("gain changes buffer capacity must be positive".into());
        }
        if u32::try_from(self.buffers.samples).is_err() {
            return invalid(format!("samples buffer capacity {} is too large", self.buffers.samples));
        }
        if 4 * self.stream.zero_fill_max_samples as usize > self.buffers.samples {
            return invalid("samples buffer is not large enough to accommodate zeroing sample gaps".into());
        }
        if self.stream.marker_interval_secs > 0 && self.output.output_type != OutputType::Wav {
            return invalid("time markers require WAV output type".into());
        }
        if !(1..=4).contains(&self.stream.internal_decimation) {
            return invalid(format!(
                "internal decimation must be 1, 2, 3 or 4, got {}",
                self.stream.internal_decimation
            ));
        }
        if self.source.decimation == 0 {
            return invalid("decimation must be at least 1".into());
        }
        if self.source.sample_rate.is_nan() || self.source.sample_rate <= 0.0 {
            return invalid("sample rate must be positive".into());
        }
        if self.source.block_size == 0 {
            return invalid("block size must be positive".into());
        }

        let template = self.filename_template();
        let is_stream = template == "-" || template.starts_with('|');
        if is_stream && !self.output.output_type.is_streamable() {
            return invalid("stdout and named pipes are only supported for raw and Linrad output".into());
        }
        if template.starts_with('|') && template[1..].trim().is_empty() {
            return invalid("empty named pipe name".into());
        }
        if self.output.gains_file && (is_stream || Path::new(template).extension().is_none()) {
            return invalid("gains file not supported when output file has no extension".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: RecorderConfig = toml::from_str("").unwrap();
        assert_eq!(config, RecorderConfig::default());
        assert_eq!(config.stream.streaming_time_secs, 10);
        assert_eq!(config.stream.zero_fill_max_samples, 100_000);
        assert_eq!(config.buffers.blocks, 2000);
        assert_eq!(config.buffers.samples, 1_048_576);
        assert_eq!(config.buffers.gain_changes, 100);
        assert_eq!(config.output.output_type, OutputType::Raw);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let toml_str = r#"
            [stream]
            dual_tuner = true
            marker_interval_secs = 5

            [output]
            type = "wav"
            gains_file = true

            [source]
            frequency_a = 7.1e6
        "#;
        let config: RecorderConfig = toml::from_str(toml_str).unwrap();
        assert!(config.stream.dual_tuner);
        assert_eq!(config.stream.streaming_time_secs, 10);
        assert_eq!(config.output.output_type, OutputType::Wav);
        assert_eq!(config.filename_template(), "RSP_recording_{TIMESTAMP}_{FREQHZ}.wav");
        assert_eq!(config.source.frequency_b(), 7.1e6);
        assert_eq!(config.capacities().gain_changes, Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_output_type_rejected() {
        let result: Result<RecorderConfig, _> = toml::from_str("[output]\ntype = \"mp3\"");
        assert!(result.is_err());
    }

    fn rejects(config: &RecorderConfig, needle: &str) {
        match config.validate() {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains(needle), "{msg}"),
            other => panic!("expected validation error containing {needle:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_fill_must_fit_samples_buffer() {
        let mut config = RecorderConfig::default();
        config.buffers.samples = 400;
        config.stream.zero_fill_max_samples = 100;
        assert!(config.validate().is_ok());
        config.stream.zero_fill_max_samples = 101;
        rejects(&config, "zeroing sample gaps");
    }

    #[test]
    fn test_markers_require_wav() {
        let mut config = RecorderConfig::default();
        config.stream.marker_interval_secs = 1;
        rejects(&config, "time markers");
        config.output.output_type = OutputType::Wav;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_internal_decimation_range() {
        let mut config = RecorderConfig::default();
        config.stream.internal_decimation = 0;
        rejects(&config, "internal decimation");
        config.stream.internal_decimation = 5;
        rejects(&config, "internal decimation");
        config.stream.internal_decimation = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wav_cannot_stream() {
        let mut config = RecorderConfig::default();
        config.output.output_type = OutputType::Wav;
        config.output.filename = Some("-".into());
        rejects(&config, "stdout");

        config.output.output_type = OutputType::Linrad;
        assert!(config.validate().is_ok());

        config.output.filename = Some("|   ".into());
        rejects(&config, "empty named pipe");
    }

    #[test]
    fn test_gains_file_needs_extension() {
        let mut config = RecorderConfig::default();
        config.output.gains_file = true;
        config.output.filename = Some("capture".into());
        rejects(&config, "extension");
        config.output.filename = Some("capture.iq".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_output_sample_rate() {
        let mut config = RecorderConfig::default();
        config.source.sample_rate = 6_000_000.0;
        config.stream.internal_decimation = 3;
        config.source.decimation = 2;
        assert_eq!(config.output_sample_rate(), 1_000_000.0);
    }
}
