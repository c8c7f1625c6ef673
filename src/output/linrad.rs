//! Linrad raw file header.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use tracing::warn;

use super::ContainerInfo;

pub const LINRAD_HEADER_SIZE: usize = 45;

const REMEMBER_UNKNOWN: i32 = -1;
const TWO_CHANNELS: i32 = 2;
const IQ_DATA: i32 = 4;
const DIGITAL_IQ: i32 = 32;

/// Packed little-endian header, written once before the first sample.
pub fn header_bytes(info: &ContainerInfo, now: DateTime<Utc>) -> [u8; LINRAD_HEADER_SIZE] {
    let (mode, rf_channels, ad_channels): (i32, i32, i32) = if info.dual_tuner {
        (IQ_DATA | DIGITAL_IQ | TWO_CHANNELS, 2, 4)
    } else {
        (IQ_DATA | DIGITAL_IQ, 1, 2)
    };
    let timestamp = now.timestamp() as f64 + 1e-9 * f64::from(now.timestamp_subsec_nanos());

    let mut header = [0u8; LINRAD_HEADER_SIZE];
    let fields: [&[u8]; 9] = [
        &REMEMBER_UNKNOWN.to_le_bytes(),
        &timestamp.to_le_bytes(),
        &(info.frequency_a / 1e6).to_le_bytes(),
        &1i32.to_le_bytes(),
        &mode.to_le_bytes(),
        &rf_channels.to_le_bytes(),
        &ad_channels.to_le_bytes(),
        &(info.sample_rate.round() as i32).to_le_bytes(),
        &[0u8],
    ];
    let mut at = 0;
    for field in fields {
        header[at..at + field.len()].copy_from_slice(field);
        at += field.len();
    }
    header
}

pub fn write_header<W: Write>(sink: &mut W, info: &ContainerInfo, now: DateTime<Utc>) -> io::Result<()> {
    if info.dual_tuner && info.frequency_b != info.frequency_a {
        warn!("Linrad header does not support different passband center frequencies for the two tuners");
    }
    sink.write_all(&header_bytes(info, now))
}
