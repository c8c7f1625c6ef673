//! Session wall-clock bookkeeping owned by the primary channel.

use chrono::{DateTime, Utc};

use crate::status::StreamStatus;

/// Wall-clock time paired with the cumulative sample count at that time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeMarker {
    pub timestamp: DateTime<Utc>,
    pub sample_num: u64,
}

#[derive(Debug, Clone)]
pub struct TimeTracker {
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
    markers: Vec<TimeMarker>,
    marker_capacity: usize,
    marker_interval_secs: u32,
    current_tick: i64,
}

impl TimeTracker {
    /// Marker storage is sized once: one slot per interval over the
    /// streaming time, plus the start marker and one for truncation.
    pub fn new(marker_interval_secs: u32, streaming_time_secs: u32) -> Self {
        let marker_capacity = if marker_interval_secs > 0 {
            (streaming_time_secs / marker_interval_secs) as usize + 2
        } else {
            0
        };
        Self {
            start: None,
            stop: None,
            markers: Vec::with_capacity(marker_capacity),
            marker_capacity,
            marker_interval_secs,
            current_tick: 0,
        }
    }

    /// Called once per primary-channel callback with the samples delivered
    /// so far.
    pub fn update(&mut self, sample_num: u64, status: StreamStatus, now: DateTime<Utc>) {
        match status {
            StreamStatus::Running => {
                self.start.get_or_insert(now);
                if self.marker_interval_secs == 0 {
                    return;
                }
                let tick = now.timestamp() / i64::from(self.marker_interval_secs);
                if tick > self.current_tick {
                    // Markers past capacity are dropped silently
                    if self.markers.len() < self.marker_capacity {
                        self.markers.push(TimeMarker {
                            timestamp: now,
                            sample_num,
                        });
                    }
                    self.current_tick = tick;
                }
            }
            StreamStatus::Terminate | StreamStatus::Done => {
                self.stop.get_or_insert(now);
            }
            _ => {}
        }
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn stop(&self) -> Option<DateTime<Utc>> {
        self.stop
    }

    pub fn markers(&self) -> &[TimeMarker] {
        &self.markers
    }

    pub fn marker_capacity(&self) -> usize {
        self.marker_capacity
    }
}
