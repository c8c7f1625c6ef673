//! Reading recordings back: container detection, sample ranges per tuner
//! and gains file listing.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use hound::{SampleFormat, WavReader};
use thiserror::Error;
use tracing::debug;

use crate::gains::{GainChange, GAIN_CHANGE_RECORD_SIZE};
use crate::output::linrad::LINRAD_HEADER_SIZE;

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Invalid recording: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Raw,
    Linrad,
    Wav,
    Rf64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Levels {
    pub imin: i16,
    pub imax: i16,
    pub qmin: i16,
    pub qmax: i16,
}

impl Default for Levels {
    fn default() -> Self {
        Self {
            imin: i16::MAX,
            imax: i16::MIN,
            qmin: i16::MAX,
            qmax: i16::MIN,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub container: Container,
    pub tuners: usize,
    pub sample_rate: Option<u32>,
    pub frames: u64,
    /// One entry per tuner.
    pub levels: Vec<Levels>,
}

/// Accumulates per-tuner ranges from interleaved I/Q values.
struct LevelScan {
    levels: Vec<Levels>,
    position: usize,
    values: u64,
}

impl LevelScan {
    fn new(tuners: usize) -> Self {
        Self {
            levels: vec![Levels::default(); tuners],
            position: 0,
            values: 0,
        }
    }

    fn push(&mut self, value: i16) {
        let levels = &mut self.levels[self.position / 2];
        if self.position % 2 == 0 {
            levels.imin = levels.imin.min(value);
            levels.imax = levels.imax.max(value);
        } else {
            levels.qmin = levels.qmin.min(value);
            levels.qmax = levels.qmax.max(value);
        }
        self.position = (self.position + 1) % (2 * self.levels.len());
        self.values += 1;
    }

    fn finish(self, container: Container, sample_rate: Option<u32>) -> RecordingSummary {
        let frame = 2 * self.levels.len() as u64;
        RecordingSummary {
            container,
            tuners: self.levels.len(),
            sample_rate,
            frames: self.values / frame,
            levels: self.levels,
        }
    }
}

fn scan_values<R: Read>(mut reader: R, limit: Option<u64>, scan: &mut LevelScan) -> io::Result<()> {
    let mut buffer = vec![0u8; 64 * 1024];
    let mut remaining = limit.unwrap_or(u64::MAX);
    let mut carry: Option<u8> = None;
    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = match reader.read(&mut buffer[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        remaining -= n as u64;
        let mut bytes = &buffer[..n];
        if let Some(low) = carry.take() {
            scan.push(i16::from_le_bytes([low, bytes[0]]));
            bytes = &bytes[1..];
        }
        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            scan.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        carry = pairs.remainder().first().copied();
    }
    Ok(())
}

fn tuners_for(channels: u16) -> Result<usize, InspectError> {
    match channels {
        2 => Ok(1),
        4 => Ok(2),
        n => Err(InspectError::Format(format!("expected 2 or 4 channels (I/Q per tuner), got {n}"))),
    }
}

fn inspect_wav(path: &Path) -> Result<RecordingSummary, InspectError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(InspectError::Format(format!(
            "expected 16-bit integer samples, got {} bits {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    let mut scan = LevelScan::new(tuners_for(spec.channels)?);
    for sample in reader.samples::<i16>() {
        scan.push(sample?);
    }
    Ok(scan.finish(Container::Wav, Some(spec.sample_rate)))
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Walks the chunks of an RF64 file, which hound does not read.
fn inspect_rf64<R: Read + Seek>(mut reader: R) -> Result<RecordingSummary, InspectError> {
    reader.seek(SeekFrom::Start(12))?;
    let mut ds64_data_size = None;
    let mut format: Option<(u16, u32)> = None;
    loop {
        let mut id = [0u8; 4];
        reader.read_exact(&mut id)?;
        let size = read_u32(&mut reader)?;
        debug!(chunk = %String::from_utf8_lossy(&id), size, "chunk");
        match &id {
            b"ds64" => {
                let _riff_size = read_u64(&mut reader)?;
                ds64_data_size = Some(read_u64(&mut reader)?);
                reader.seek(SeekFrom::Current(i64::from(size) - 16))?;
            }
            b"fmt " => {
                let mut fmt = [0u8; 16];
                reader.read_exact(&mut fmt)?;
                let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
                let rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
                format = Some((channels, rate));
                reader.seek(SeekFrom::Current(i64::from(size) - 16))?;
            }
            b"data" => {
                let (channels, rate) =
                    format.ok_or_else(|| InspectError::Format("data chunk before fmt chunk".into()))?;
                let data_size = match (size, ds64_data_size) {
                    (u32::MAX, Some(size)) => size,
                    (u32::MAX, None) => return Err(InspectError::Format("RF64 file without ds64 chunk".into())),
                    (size, _) => u64::from(size),
                };
                let mut scan = LevelScan::new(tuners_for(channels)?);
                scan_values(reader, Some(data_size), &mut scan)?;
                return Ok(scan.finish(Container::Rf64, Some(rate)));
            }
            _ => {
                reader.seek(SeekFrom::Current(i64::from(size) + i64::from(size % 2)))?;
            }
        }
    }
}

/// Reads the Linrad header's channel count and sample rate.
fn linrad_format(header: &[u8; LINRAD_HEADER_SIZE]) -> Result<(usize, u32), InspectError> {
    let field = |at: usize| i32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let tuners = match field(28) {
        1 => 1,
        2 => 2,
        n => return Err(InspectError::Format(format!("unexpected Linrad rf channel count {n}"))),
    };
    let rate = u32::try_from(field(36)).map_err(|_| InspectError::Format("negative Linrad sample rate".into()))?;
    Ok((tuners, rate))
}

/// Summarizes a recording. `tuners` is only used for raw files, which
/// carry no header.
pub fn inspect_recording(path: &Path, tuners: usize) -> Result<RecordingSummary, InspectError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    let header_len = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    match (header_len, &magic) {
        (4, b"RIFF") => inspect_wav(path),
        (4, b"RF64") => inspect_rf64(BufReader::new(file)),
        (4, [0xff, 0xff, 0xff, 0xff]) if file.metadata()?.len() >= LINRAD_HEADER_SIZE as u64 => {
            let mut reader = BufReader::new(file);
            let mut header = [0u8; LINRAD_HEADER_SIZE];
            reader.read_exact(&mut header)?;
            let (tuners, rate) = linrad_format(&header)?;
            let mut scan = LevelScan::new(tuners);
            scan_values(reader, None, &mut scan)?;
            Ok(scan.finish(Container::Linrad, Some(rate)))
        }
        _ => {
            if !(1..=2).contains(&tuners) {
                return Err(InspectError::Format(format!("raw recordings have 1 or 2 tuners, got {tuners}")));
            }
            let mut scan = LevelScan::new(tuners);
            scan_values(BufReader::new(file), None, &mut scan)?;
            Ok(scan.finish(Container::Raw, None))
        }
    }
}

/// Reads every record of a gains file.
pub fn read_gains(path: &Path) -> Result<Vec<GainChange>, InspectError> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % GAIN_CHANGE_RECORD_SIZE != 0 {
        return Err(InspectError::Format(format!(
            "gains file size {} is not a multiple of {GAIN_CHANGE_RECORD_SIZE}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(GAIN_CHANGE_RECORD_SIZE)
        .filter_map(GainChange::from_bytes)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_values(path: &Path, header: &[u8], values: &[i16]) {
        let mut file = File::create(path).unwrap();
        file.write_all(header).unwrap();
        for v in values {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn test_raw_dual_tuner_levels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.iq");
        write_values(&path, &[], &[1, -1, 100, -100, 5, -5, 200, -200]);

        let summary = inspect_recording(&path, 2).unwrap();
        assert_eq!(summary.container, Container::Raw);
        assert_eq!(summary.frames, 2);
        assert_eq!(
            summary.levels,
            vec![
                Levels { imin: 1, imax: 5, qmin: -5, qmax: -1 },
                Levels { imin: 100, imax: 200, qmin: -200, qmax: -100 },
            ]
        );
    }

    #[test]
    fn test_wav_via_hound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for v in [3i16, -3, 7, -7] {
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();

        let summary = inspect_recording(&path, 1).unwrap();
        assert_eq!(summary.container, Container::Wav);
        assert_eq!(summary.sample_rate, Some(48_000));
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.levels[0].imax, 7);
        assert_eq!(summary.levels[0].qmin, -7);
    }

    #[test]
    fn test_rf64_chunk_walk() {
        let mut file = Vec::new();
        file.extend_from_slice(b"RF64");
        file.extend_from_slice(&u32::MAX.to_le_bytes());
        file.extend_from_slice(b"WAVE");
        file.extend_from_slice(b"ds64");
        file.extend_from_slice(&28u32.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&8u64.to_le_bytes());
        file.extend_from_slice(&2u64.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(b"fmt ");
        file.extend_from_slice(&16u32.to_le_bytes());
        file.extend_from_slice(&1u16.to_le_bytes());
        file.extend_from_slice(&2u16.to_le_bytes());
        file.extend_from_slice(&1000u32.to_le_bytes());
        file.extend_from_slice(&4000u32.to_le_bytes());
        file.extend_from_slice(&4u16.to_le_bytes());
        file.extend_from_slice(&16u16.to_le_bytes());
        file.extend_from_slice(b"r64m");
        file.extend_from_slice(&3u32.to_le_bytes());
        file.extend_from_slice(&[0, 0, 0, 0]);
        file.extend_from_slice(b"data");
        file.extend_from_slice(&u32::MAX.to_le_bytes());
        for v in [10i16, -20, 30, -40, 99] {
            file.extend_from_slice(&v.to_le_bytes());
        }

        let summary = inspect_rf64(io::Cursor::new(file)).unwrap();
        assert_eq!(summary.container, Container::Rf64);
        assert_eq!(summary.sample_rate, Some(1000));
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.levels[0], Levels { imin: 10, imax: 30, qmin: -40, qmax: -20 });
    }

    #[test]
    fn test_gains_file_must_be_whole_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.gains");
        let record = GainChange::new(42, 30.5, 1, 20, 3);
        std::fs::write(&path, bytemuck::bytes_of(&record)).unwrap();
        assert_eq!(read_gains(&path).unwrap(), vec![record]);

        std::fs::write(&path, [0u8; 17]).unwrap();
        assert!(matches!(read_gains(&path), Err(InspectError::Format(_))));
    }
}
