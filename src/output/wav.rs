//! RIFF/RF64 WAVE container (EBU Tech 3306) with a SpectraVue `auxi` chunk
//! and optional `r64m` time markers.
//!
//! The header is written up front with placeholder sizes. Finalizing seeks
//! back and either patches the 32-bit sizes, or turns the file into RF64
//! by rewriting the `JUNK` chunk as `ds64`.

use std::io::{self, Seek, SeekFrom, Write};

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, warn};

use super::ContainerInfo;
use crate::timeinfo::{TimeMarker, TimeTracker};

const WAVE_FORMAT_PCM: u16 = 1;
const DB_OFFSET: u32 = 0xe49b_72a9;

pub const RIFF_HEADER_SIZE: u64 = 12;
pub const JUNK_CHUNK_SIZE: u64 = 8 + 28;
pub const FMT_CHUNK_SIZE: u64 = 8 + 16;
pub const AUXI_CHUNK_SIZE: u64 = 8 + 68;
pub const MARKER_CHUNK_HEADER_SIZE: u64 = 8;
pub const MARKER_ENTRY_SIZE: u64 = 320;
pub const DATA_CHUNK_HEADER_SIZE: u64 = 8;

const LABEL_SIZE: usize = 256;
const AUXI_TIMES_OFFSET: u64 = RIFF_HEADER_SIZE + JUNK_CHUNK_SIZE + FMT_CHUNK_SIZE + 8;

/// Byte sizes of the header chunks ahead of the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavLayout {
    pub marker_capacity: usize,
}

impl WavLayout {
    pub fn markers_size(&self) -> u64 {
        if self.marker_capacity == 0 {
            0
        } else {
            MARKER_CHUNK_HEADER_SIZE + self.marker_capacity as u64 * MARKER_ENTRY_SIZE
        }
    }

    /// Offset of the first sample byte.
    pub fn header_size(&self) -> u64 {
        RIFF_HEADER_SIZE + JUNK_CHUNK_SIZE + FMT_CHUNK_SIZE + AUXI_CHUNK_SIZE + self.markers_size() + DATA_CHUNK_HEADER_SIZE
    }

    fn data_size_offset(&self) -> u64 {
        self.header_size() - 4
    }

    fn riff_size(&self, data_size: u64) -> u64 {
        self.header_size() - 8 + data_size
    }
}

struct ChunkWriter {
    bytes: Vec<u8>,
}

impl ChunkWriter {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn id(&mut self, id: &[u8; 4]) -> &mut Self {
        self.bytes.extend_from_slice(id);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64_split(&mut self, v: u64) -> &mut Self {
        self.u32(v as u32).u32((v >> 32) as u32)
    }

    fn zeros(&mut self, n: usize) -> &mut Self {
        self.bytes.resize(self.bytes.len() + n, 0);
        self
    }

    fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }
}

/// Sub-second part rounded to the nearest millisecond, kept within the
/// current second.
fn rounded_millis(t: &DateTime<Utc>) -> u16 {
    ((t.timestamp_subsec_nanos() + 500_000) / 1_000_000).min(999) as u16
}

/// Windows SYSTEMTIME as stored in the `auxi` chunk.
fn system_time(t: Option<DateTime<Utc>>) -> [u8; 16] {
    let mut out = ChunkWriter::new();
    match t {
        Some(t) => {
            out.u16(t.year() as u16)
                .u16(t.month() as u16)
                .u16(t.weekday().num_days_from_sunday() as u16)
                .u16(t.day() as u16)
                .u16(t.hour() as u16)
                .u16(t.minute() as u16)
                .u16(t.second() as u16)
                .u16(rounded_millis(&t));
        }
        None => {
            out.zeros(16);
        }
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&out.bytes);
    bytes
}

pub fn header_bytes(info: &ContainerInfo) -> Vec<u8> {
    let layout = WavLayout {
        marker_capacity: info.marker_capacity,
    };
    let channels: u16 = if info.dual_tuner { 4 } else { 2 };
    let sample_rate = info.sample_rate.round() as u32;
    let block_align = channels * 2;
    let gain_a = (f64::from(info.gain_a) * 1000.0 + 0.5) as u32;
    let gain_b = info.gain_b.map_or(0, |g| (f64::from(g) * 1000.0 + 0.5) as u32);

    let mut w = ChunkWriter::new();
    w.id(b"RIFF").u32(0).id(b"WAVE");
    w.id(b"JUNK").u32(28).zeros(28);
    w.id(b"fmt ")
        .u32(16)
        .u16(WAVE_FORMAT_PCM)
        .u16(channels)
        .u32(sample_rate)
        .u32(sample_rate * u32::from(block_align))
        .u16(block_align)
        .u16(16);
    // Start and stop times are filled in when finalizing
    w.id(b"auxi")
        .u32(68)
        .zeros(32)
        .u32(info.frequency_a as u32)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(DB_OFFSET)
        .u32(0)
        .u32(gain_a)
        .u32(gain_b);
    if layout.marker_capacity > 0 {
        w.id(b"r64m")
            .u32((layout.marker_capacity as u64 * MARKER_ENTRY_SIZE) as u32)
            .zeros(layout.marker_capacity * MARKER_ENTRY_SIZE as usize);
    }
    w.id(b"data").u32(0);

    debug_assert_eq!(w.bytes.len() as u64, layout.header_size());
    w.bytes
}

pub fn write_header<W: Write>(sink: &mut W, info: &ContainerInfo) -> io::Result<()> {
    if info.dual_tuner && info.frequency_b != info.frequency_a {
        warn!("WAV auxi chunk can store only one center frequency");
    }
    sink.write_all(&header_bytes(info))
}

fn marker_entry(marker: &TimeMarker) -> Vec<u8> {
    let label = marker.timestamp.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string();
    let mut label_bytes = [0u8; LABEL_SIZE];
    let n = label.len().min(LABEL_SIZE - 1);
    label_bytes[..n].copy_from_slice(&label.as_bytes()[..n]);

    let mut w = ChunkWriter::new();
    w.u32(1)
        .u64_split(marker.sample_num)
        .u64_split(0)
        .zeros(8)
        .raw(&label_bytes)
        .zeros(4 + 16 + 16);
    w.bytes
}

/// What finalizing needs to know about the finished recording.
#[derive(Debug, Clone, Copy)]
pub struct Totals {
    pub data_size: u64,
    pub output_samples: u64,
}

/// Returns true when the file was promoted to RF64.
pub fn finalize<F: Write + Seek>(file: &mut F, layout: WavLayout, totals: Totals, timeinfo: &TimeTracker) -> io::Result<bool> {
    let riff_size = layout.riff_size(totals.data_size);
    let rf64 = riff_size >= u64::from(u32::MAX) || layout.marker_capacity > 0;

    if rf64 {
        let mut ds64 = ChunkWriter::new();
        ds64.id(b"ds64")
            .u32(28)
            .u64_split(riff_size)
            .u64_split(totals.data_size)
            .u64_split(totals.output_samples)
            .u32(0);
        file.seek(SeekFrom::Start(RIFF_HEADER_SIZE))?;
        file.write_all(&ds64.bytes)?;

        file.seek(SeekFrom::Start(4))?;
        file.write_all(&u32::MAX.to_le_bytes())?;
        file.seek(SeekFrom::Start(layout.data_size_offset()))?;
        file.write_all(&u32::MAX.to_le_bytes())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(b"RF64")?;
    } else {
        file.seek(SeekFrom::Start(layout.data_size_offset()))?;
        file.write_all(&(totals.data_size as u32).to_le_bytes())?;
        file.seek(SeekFrom::Start(4))?;
        file.write_all(&(riff_size as u32).to_le_bytes())?;
    }

    file.seek(SeekFrom::Start(AUXI_TIMES_OFFSET))?;
    file.write_all(&system_time(timeinfo.start()))?;
    file.write_all(&system_time(timeinfo.stop()))?;

    if layout.marker_capacity > 0 {
        let entries_offset = layout.header_size() - DATA_CHUNK_HEADER_SIZE - layout.markers_size() + MARKER_CHUNK_HEADER_SIZE;
        file.seek(SeekFrom::Start(entries_offset))?;
        for marker in timeinfo.markers().iter().take(layout.marker_capacity) {
            file.write_all(&marker_entry(marker))?;
        }
    }

    file.seek(SeekFrom::End(0))?;
    file.flush()?;
    debug!(rf64, riff_size, markers = timeinfo.markers().len(), "WAV file finalized");
    Ok(rf64)
}
