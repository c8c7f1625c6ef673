//! Replays a raw recording (interleaved native-endian 16-bit I/Q, one or
//! two tuners per frame) as if it were arriving from the device.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use tracing::{debug, info, warn};

use super::{DeviceInfo, Pacer, SampleSource, SourceError};
use crate::ingest::DeviceCallbacks;
use crate::ring::ChannelId;
use crate::sequence::next_expected_sample_num;

pub struct FileSource<R = BufReader<File>> {
    reader: R,
    info: DeviceInfo,
    block_size: usize,
    realtime: bool,
}

impl FileSource {
    pub fn open(path: &Path, info: DeviceInfo, block_size: usize, realtime: bool) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "replaying recording");
        Ok(Self::from_reader(BufReader::new(file), info, block_size, realtime))
    }
}

impl<R: Read> FileSource<R> {
    pub fn from_reader(reader: R, info: DeviceInfo, block_size: usize, realtime: bool) -> Self {
        Self {
            reader,
            info,
            block_size,
            realtime,
        }
    }

    fn channels(&self) -> usize {
        if self.info.dual_tuner {
            2
        } else {
            1
        }
    }

    /// Reads up to one block of whole frames into `buffer`. Returns the
    /// number of frames read; 0 means end of input.
    fn read_block(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let frame_bytes = self.channels() * 4;
        let mut filled = 0;
        while filled < buffer.len() {
            match self.reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled % frame_bytes != 0 {
            warn!(bytes = filled % frame_bytes, "ignoring trailing partial frame");
        }
        Ok(filled / frame_bytes)
    }
}

/// Splits `frames` interleaved frames into per-tuner I and Q lanes.
fn deinterleave(bytes: &[u8], frames: usize, channels: usize, lanes: &mut [Vec<i16>]) {
    for lane in lanes.iter_mut() {
        lane.clear();
    }
    let values = bytes[..frames * channels * 4]
        .chunks_exact(2)
        .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]));
    for (k, value) in values.enumerate() {
        lanes[k % (2 * channels)].push(value);
    }
}

impl<R: Read + Send> SampleSource for FileSource<R> {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn run(&mut self, callbacks: &mut DeviceCallbacks) -> Result<(), SourceError> {
        if self.block_size == 0 {
            return Err(SourceError::Invalid("block size must be positive".into()));
        }
        let channels = self.channels();
        let mut buffer = vec![0u8; self.block_size * channels * 4];
        // I_A, Q_A, then I_B, Q_B in dual tuner mode
        let mut lanes = vec![Vec::with_capacity(self.block_size); 2 * channels];
        let pacer = Pacer::new(self.realtime, self.block_size, self.info.output_sample_rate);

        let mut first_sample_num = 0u32;
        let mut blocks = 0u64;
        let mut end_of_input = false;

        while callbacks.wants_more() {
            let frames = if end_of_input { 0 } else { self.read_block(&mut buffer)? };
            if frames == 0 && !end_of_input {
                end_of_input = true;
                debug!(blocks, "end of input");
                callbacks.request_terminate();
            }

            deinterleave(&buffer, frames, channels, &mut lanes);
            if self.info.dual_tuner {
                callbacks.deliver_pair(first_sample_num, (&lanes[0], &lanes[1]), (&lanes[2], &lanes[3]));
            } else {
                callbacks.deliver_samples(ChannelId::A, first_sample_num, &lanes[0], &lanes[1]);
            }

            first_sample_num =
                next_expected_sample_num(first_sample_num, frames as u32, self.info.internal_decimation);
            blocks += 1;
            if !end_of_input {
                pacer.wait_for_block(blocks);
            }
        }
        Ok(())
    }
}
