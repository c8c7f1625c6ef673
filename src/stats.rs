//! End-of-session statistics.

use std::time::Duration;

use tracing::info;

use crate::buffers::BufferUsage;
use crate::ingest::{ChannelReport, ChannelStats, IngestReport};
use crate::writer::WriteStats;

/// Peak sample magnitude relative to 16-bit full scale, in dBFS. `None`
/// when nothing but zeros (or nothing at all) was seen.
pub fn dynamic_range(stats: &ChannelStats) -> Option<f64> {
    if !stats.has_samples() {
        return None;
    }
    let ratios = [
        (stats.imin < 0).then(|| f64::from(stats.imin) / f64::from(i16::MIN)),
        (stats.imax > 0).then(|| f64::from(stats.imax) / f64::from(i16::MAX)),
        (stats.qmin < 0).then(|| f64::from(stats.qmin) / f64::from(i16::MIN)),
        (stats.qmax > 0).then(|| f64::from(stats.qmax) / f64::from(i16::MAX)),
    ];
    let peak = ratios.into_iter().flatten().fold(0.0f64, f64::max);
    (peak > 0.0).then(|| 20.0 * peak.log10())
}

/// Time between the first and the last callback of a channel.
pub fn elapsed(stats: &ChannelStats) -> Option<Duration> {
    let (first, last) = (stats.earliest_callback?, stats.latest_callback?);
    (last - first).to_std().ok()
}

/// Sample rate the device actually delivered, from callback timestamps.
pub fn actual_sample_rate(stats: &ChannelStats) -> Option<f64> {
    let secs = elapsed(stats)?.as_secs_f64();
    (secs > 0.0).then(|| stats.total_samples as f64 / secs)
}

fn report_channel(report: &ChannelReport) {
    let stats = &report.stats;
    let (num_samples_min, num_samples_max) = if stats.has_samples() {
        (stats.num_samples_min, stats.num_samples_max)
    } else {
        (0, 0)
    };
    info!(
        channel = %report.channel,
        total_samples = stats.total_samples,
        dropped_samples = stats.dropped_samples,
        elapsed = ?elapsed(stats),
        actual_sample_rate = actual_sample_rate(stats).map(f64::round),
        "tuner {} stream",
        report.channel
    );
    if stats.has_samples() {
        info!(
            channel = %report.channel,
            i_range = ?(stats.imin, stats.imax),
            q_range = ?(stats.qmin, stats.qmax),
            dynamic_range_dbfs = dynamic_range(stats).map(|db| (db * 10.0).round() / 10.0),
            "tuner {} levels",
            report.channel
        );
    }
    info!(
        channel = %report.channel,
        samples_per_callback = ?(num_samples_min, num_samples_max),
        gain_changes = stats.gain_changes,
        "tuner {} callbacks",
        report.channel
    );
}

/// Logs the statistics of a finished session.
pub fn report(ingest: &IngestReport, writer: &WriteStats, usage: &BufferUsage) {
    for channel in &ingest.channels {
        report_channel(channel);
    }

    let channels = ingest.channels.len();
    if channels > 1 {
        info!(output_samples = writer.output_samples, "output samples (x{channels})");
    } else {
        info!(output_samples = writer.output_samples, "output samples");
    }
    info!(
        data_size = writer.data_size,
        zero_filled_samples = writer.zero_filled_samples,
        gaps_filled = writer.gaps_filled,
        gaps_skipped = writer.gaps_skipped,
        "output data"
    );
    info!(
        blocks = %format!("{}/{}", usage.blocks.in_use_max, usage.blocks.capacity),
        samples = %format!("{}/{}", usage.samples.in_use_max, usage.samples.capacity),
        gain_changes = %usage
            .gain_changes
            .map(|g| format!("{}/{}", g.in_use_max, g.capacity))
            .unwrap_or_else(|| "-".into()),
        "buffer usage"
    );
    info!(
        average = ?writer.average_write_elapsed(),
        max = ?writer.max_write_elapsed,
        total = writer.total_writes,
        full = writer.full_writes,
        partial = writer.partial_writes,
        zero = writer.zero_writes,
        "writes"
    );
}
