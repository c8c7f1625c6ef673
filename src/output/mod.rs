pub mod linrad;
pub mod template;
pub mod wav;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::OutputType;
use crate::timeinfo::TimeTracker;
use crate::writer::WriteStats;

pub use template::{expand_template, gains_path, FilenameContext};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("Output I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported output: {0}")]
    Unsupported(String),
}

/// Stream parameters recorded in container headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerInfo {
    pub dual_tuner: bool,
    /// Output sample rate, after all decimation.
    pub sample_rate: f64,
    pub frequency_a: f64,
    pub frequency_b: f64,
    pub gain_a: f32,
    pub gain_b: Option<f32>,
    pub marker_capacity: usize,
}

/// Where an expanded filename points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    Pipe(PathBuf),
    File(PathBuf),
}

impl OutputTarget {
    /// `-` is stdout, `|name` an existing named pipe, anything else a file.
    pub fn parse(name: &str) -> Self {
        if name == "-" {
            OutputTarget::Stdout
        } else if let Some(pipe) = name.strip_prefix('|') {
            OutputTarget::Pipe(PathBuf::from(pipe.trim()))
        } else {
            OutputTarget::File(PathBuf::from(name))
        }
    }

    /// Regular file path, if the target is seekable.
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            OutputTarget::File(path) => Some(path),
            _ => None,
        }
    }
}

pub enum OutputSink {
    Stdout(io::Stdout),
    Pipe(File),
    File(File),
}

impl OutputSink {
    pub fn open(target: &OutputTarget) -> Result<Self, OutputError> {
        match target {
            OutputTarget::Stdout => Ok(OutputSink::Stdout(io::stdout())),
            OutputTarget::Pipe(path) => {
                check_fifo(path)?;
                let pipe = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|source| OutputError::Open {
                        path: path.clone(),
                        source,
                    })?;
                Ok(OutputSink::Pipe(pipe))
            }
            OutputTarget::File(path) => {
                let file = File::create(path).map_err(|source| OutputError::Open {
                    path: path.clone(),
                    source,
                })?;
                Ok(OutputSink::File(file))
            }
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut File> {
        match self {
            OutputSink::File(file) => Some(file),
            _ => None,
        }
    }
}

#[cfg(unix)]
fn check_fifo(path: &Path) -> Result<(), OutputError> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = std::fs::metadata(path).map_err(|source| OutputError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    if metadata.file_type().is_fifo() {
        Ok(())
    } else {
        Err(OutputError::Unsupported(format!("{} is not a named pipe", path.display())))
    }
}

#[cfg(not(unix))]
fn check_fifo(_path: &Path) -> Result<(), OutputError> {
    Ok(())
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputSink::Stdout(out) => out.write(buf),
            OutputSink::Pipe(pipe) => pipe.write(buf),
            OutputSink::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Stdout(out) => out.flush(),
            OutputSink::Pipe(pipe) => pipe.flush(),
            OutputSink::File(file) => file.flush(),
        }
    }
}

/// Writes the container header, if the type has one.
pub fn write_header<W: Write>(
    sink: &mut W,
    output_type: OutputType,
    info: &ContainerInfo,
    now: DateTime<Utc>,
) -> Result<(), OutputError> {
    match output_type {
        OutputType::Raw => {}
        OutputType::Linrad => linrad::write_header(sink, info, now)?,
        OutputType::Wav => wav::write_header(sink, info)?,
    }
    debug!(?output_type, "container header written");
    Ok(())
}

/// Completes the container once the writer is done with the sink.
pub fn finalize(
    sink: &mut OutputSink,
    output_type: OutputType,
    info: &ContainerInfo,
    stats: &WriteStats,
    timeinfo: &TimeTracker,
) -> Result<(), OutputError> {
    sink.flush()?;
    if output_type != OutputType::Wav {
        return Ok(());
    }

    let file = sink
        .as_file_mut()
        .ok_or_else(|| OutputError::Unsupported("WAV output requires a regular file".into()))?;
    let layout = wav::WavLayout {
        marker_capacity: info.marker_capacity,
    };
    let totals = wav::Totals {
        data_size: stats.data_size,
        output_samples: stats.output_samples,
    };
    if wav::finalize(file, layout, totals, timeinfo)? {
        info!("output promoted to RF64");
    }
    Ok(())
}

/// Creates the gains file next to the output file.
pub fn open_gains_file(output: &Path) -> Result<(PathBuf, File), OutputError> {
    let path = gains_path(output).ok_or_else(|| {
        OutputError::Unsupported(format!("gains file needs an output with an extension: {}", output.display()))
    })?;
    let file = File::create(&path).map_err(|source| OutputError::Open {
        path: path.clone(),
        source,
    })?;
    Ok((path, file))
}
