//! One recording from start to finished container: buffers, the output
//! sink, the writer thread, the source thread and the duration timer.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::buffers::{BufferUsage, StreamBuffers};
use crate::config::{ConfigError, RecorderConfig};
use crate::ingest::{DeviceCallbacks, IngestReport};
use crate::input::{SampleSource, SourceError};
use crate::output::{self, FilenameContext, OutputError, OutputSink, OutputTarget};
use crate::stats;
use crate::status::StreamStatus;
use crate::timeinfo::TimeTracker;
use crate::writer::{StreamError, StreamWriter, WriteStats};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Stream failed: {0}")]
    Stream(#[from] StreamError),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn { name: &'static str, source: io::Error },

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

/// Stops a running session from outside, e.g. on a signal.
#[derive(Clone)]
pub struct TerminateHandle {
    buffers: Arc<StreamBuffers>,
}

impl TerminateHandle {
    /// Returns false if the session was not running.
    pub fn terminate(&self) -> bool {
        self.buffers.request_terminate()
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub status: StreamStatus,
    /// Regular output file, if the output was not stdout or a pipe.
    pub output: Option<PathBuf>,
    pub gains: Option<PathBuf>,
    pub ingest: IngestReport,
    pub writer: WriteStats,
    pub usage: BufferUsage,
}

pub struct Session {
    config: RecorderConfig,
    buffers: Arc<StreamBuffers>,
}

fn spawn<T, F>(name: &'static str, f: F) -> Result<thread::JoinHandle<T>, SessionError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| SessionError::Spawn { name, source })
}

impl Session {
    /// Validates the configuration and allocates the stream buffers.
    pub fn new(config: RecorderConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let buffers = Arc::new(StreamBuffers::new(&config.capacities()));
        Ok(Self { config, buffers })
    }

    pub fn terminate_handle(&self) -> TerminateHandle {
        TerminateHandle {
            buffers: Arc::clone(&self.buffers),
        }
    }

    /// Records until the streaming time elapses, the source runs dry, a
    /// terminate request arrives or the stream fails. The container is
    /// finalized in every case once the writer has stopped.
    pub fn run(self, mut source: Box<dyn SampleSource>) -> Result<SessionReport, SessionError> {
        let Session { config, buffers } = self;
        let device = source.info();
        if device.dual_tuner != config.stream.dual_tuner {
            return Err(SourceError::Invalid(format!(
                "source delivers {} tuner(s), configuration expects {}",
                if device.dual_tuner { 2 } else { 1 },
                if config.stream.dual_tuner { 2 } else { 1 }
            ))
            .into());
        }

        let now = Utc::now();
        let timeinfo = TimeTracker::new(config.stream.marker_interval_secs, config.stream.streaming_time_secs);
        let container = device.container_info(timeinfo.marker_capacity());
        let output_type = config.output.output_type;

        let filename = output::expand_template(
            config.filename_template(),
            &FilenameContext {
                now,
                frequency_a: device.frequency_a,
                frequency_b: device.dual_tuner.then_some(device.frequency_b),
            },
        );
        let target = OutputTarget::parse(&filename);
        let mut sink = OutputSink::open(&target)?;
        output::write_header(&mut sink, output_type, &container, now)?;

        let gains: Option<(PathBuf, File)> = match (config.output.gains_file, target.file_path()) {
            (true, Some(path)) => Some(output::open_gains_file(path)?),
            (true, None) => {
                return Err(OutputError::Unsupported("gains file requires a regular output file".into()).into())
            }
            (false, _) => None,
        };
        let gains_path = gains.as_ref().map(|(path, _)| path.clone());

        info!(
            output = %filename,
            ?output_type,
            sample_rate = device.output_sample_rate,
            dual_tuner = device.dual_tuner,
            "recording started"
        );

        let mut writer = StreamWriter::new(
            Arc::clone(&buffers),
            config.writer_settings(),
            sink,
            gains.map(|(_, file)| file),
        );
        let mut callbacks = DeviceCallbacks::new(
            Arc::clone(&buffers),
            device.dual_tuner,
            device.internal_decimation,
            timeinfo,
        );

        // Running before the source starts, so no batch of a finite input
        // is discarded as early
        buffers.status.start();

        let writer_thread = spawn("stream-writer", move || {
            let result = writer.run();
            (writer, result)
        })?;

        let source_buffers = Arc::clone(&buffers);
        let source_thread = spawn("sample-source", move || {
            let result = source.run(&mut callbacks);
            if let Err(e) = &result {
                error!("sample source failed: {e}");
                source_buffers.fail(StreamStatus::Failed);
            }
            (callbacks, result)
        })?;

        let (stop_timer, timer_stopped) = mpsc::channel::<()>();
        let timer_thread = match config.stream.streaming_time_secs {
            0 => None,
            secs => {
                let timer_buffers = Arc::clone(&buffers);
                Some(spawn("stream-timer", move || {
                    if let Err(mpsc::RecvTimeoutError::Timeout) =
                        timer_stopped.recv_timeout(Duration::from_secs(u64::from(secs)))
                    {
                        if timer_buffers.request_terminate() {
                            info!(secs, "streaming time elapsed");
                        }
                    }
                })?)
            }
        };

        let source_joined = source_thread.join();
        if source_joined.is_err() {
            buffers.fail(StreamStatus::Failed);
        }
        drop(stop_timer);
        let writer_joined = writer_thread.join();
        if let Some(timer) = timer_thread {
            if timer.join().is_err() {
                warn!("stream timer panicked");
            }
        }

        let (callbacks, source_result) = source_joined.map_err(|_| SessionError::Panicked("sample-source"))?;
        let (writer, stream_result) = writer_joined.map_err(|_| SessionError::Panicked("stream-writer"))?;
        let (mut sink, gains, write_stats) = writer.into_parts();
        let ingest = callbacks.into_report();

        output::finalize(&mut sink, output_type, &container, &write_stats, &ingest.timeinfo)?;
        if let Some(mut gains) = gains {
            gains.flush().map_err(OutputError::Io)?;
        }

        let usage = buffers.usage();
        let status = buffers.status.load();
        stats::report(&ingest, &write_stats, &usage);
        debug!(%status, "session ended");

        source_result?;
        stream_result?;

        Ok(SessionReport {
            status,
            output: target.file_path().map(|p| p.to_path_buf()),
            gains: gains_path,
            ingest,
            writer: write_stats,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputType;
    use crate::input::{DeviceInfo, SyntheticSource};

    fn config(dir: &std::path::Path, output_type: OutputType, name: &str) -> RecorderConfig {
        let mut config = RecorderConfig::default();
        config.stream.streaming_time_secs = 0;
        config.output.output_type = output_type;
        config.output.filename = Some(dir.join(name).to_string_lossy().into_owned());
        config.source.sample_rate = 48_000.0;
        config.source.block_size = 64;
        config.source.realtime = false;
        config
    }

    fn synthetic(config: &RecorderConfig, blocks: u64) -> Box<dyn SampleSource> {
        let info = DeviceInfo::from_config(config);
        Box::new(SyntheticSource::new(info, config.source.block_size as usize, &config.source).with_block_limit(blocks))
    }

    #[test]
    fn test_raw_session_writes_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), OutputType::Raw, "rec.iq");
        let source = synthetic(&config, 10);

        let report = Session::new(config).unwrap().run(source).unwrap();
        assert_eq!(report.status, StreamStatus::Done);
        assert_eq!(report.writer.output_samples, 640);
        let path = report.output.unwrap();
        assert_eq!(std::fs::metadata(path).unwrap().len(), 640 * 4);
    }

    #[test]
    fn test_invalid_config_rejected_before_start() {
        let mut config = RecorderConfig::default();
        config.stream.internal_decimation = 9;
        assert!(matches!(Session::new(config), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_tuner_count_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), OutputType::Raw, "rec.iq");
        let mut dual = config.clone();
        dual.stream.dual_tuner = true;
        let source = synthetic(&dual, 1);
        assert!(matches!(
            Session::new(config).unwrap().run(source),
            Err(SessionError::Source(SourceError::Invalid(_)))
        ));
    }

    #[test]
    fn test_terminate_handle_stops_open_ended_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), OutputType::Linrad, "rec.raw");
        let info = DeviceInfo::from_config(&config);
        let source = Box::new(SyntheticSource::new(info, 64, &config.source));

        let session = Session::new(config).unwrap();
        let handle = session.terminate_handle();
        let stopper = thread::spawn(move || {
            while !handle.terminate() {
                thread::sleep(Duration::from_millis(5));
            }
        });
        let report = session.run(source).unwrap();
        stopper.join().unwrap();
        assert_eq!(report.status, StreamStatus::Done);
        let len = std::fs::metadata(report.output.unwrap()).unwrap().len();
        assert_eq!(len, 45 + report.writer.data_size);
    }
}
