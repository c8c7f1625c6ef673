//! End-to-end recordings through the public session API.

use std::path::Path;

use iq_recorder::input::{DeviceInfo, FileSource, SampleSource, SyntheticSource};
use iq_recorder::inspect::{self, Container};
use iq_recorder::{OutputType, RecorderConfig, Session, SessionError, StreamStatus};

fn config(dir: &Path, output_type: OutputType, name: &str) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.stream.streaming_time_secs = 0;
    config.output.output_type = output_type;
    config.output.filename = Some(dir.join(name).to_string_lossy().into_owned());
    config.source.sample_rate = 96_000.0;
    config.source.block_size = 64;
    config.source.realtime = false;
    config
}

fn synthetic(config: &RecorderConfig, blocks: u64) -> SyntheticSource {
    SyntheticSource::new(DeviceInfo::from_config(config), config.source.block_size as usize, &config.source)
        .with_block_limit(blocks)
}

fn boxed(source: SyntheticSource) -> Box<dyn SampleSource> {
    Box::new(source)
}

#[test]
fn test_wav_recording_with_zero_filled_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OutputType::Wav, "rec.wav");
    let source = synthetic(&config, 12).with_dropped_blocks(3);

    let report = Session::new(config).unwrap().run(boxed(source)).unwrap();
    assert_eq!(report.status, StreamStatus::Done);
    assert_eq!(report.writer.output_samples, 12 * 64);
    assert_eq!(report.writer.gaps_filled, 3);
    assert_eq!(report.ingest.channels[0].stats.dropped_samples, 3 * 64);

    let path = report.output.unwrap();
    let mut reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().channels, 2);
    assert_eq!(reader.spec().sample_rate, 96_000);
    let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(samples.len(), 12 * 64 * 2);
    // block 3 was lost and replaced by silence
    assert!(samples[3 * 128..4 * 128].iter().all(|&v| v == 0));
    assert_eq!(samples[0], 8192);
}

#[test]
fn test_large_gap_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), OutputType::Raw, "rec.iq");
    config.stream.zero_fill_max_samples = 10;
    let source = synthetic(&config, 6).with_dropped_blocks(4);

    let report = Session::new(config).unwrap().run(boxed(source)).unwrap();
    assert_eq!(report.writer.gaps_skipped, 1);
    assert_eq!(report.writer.output_samples, 5 * 64);
    assert_eq!(report.writer.data_size, 5 * 64 * 4);
}

#[test]
fn test_time_markers_promote_to_rf64() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), OutputType::Wav, "markers.wav");
    config.stream.marker_interval_secs = 1;
    let source = synthetic(&config, 8);

    let report = Session::new(config).unwrap().run(boxed(source)).unwrap();
    assert!(!report.ingest.timeinfo.markers().is_empty());

    let path = report.output.unwrap();
    let summary = inspect::inspect_recording(&path, 1).unwrap();
    assert_eq!(summary.container, Container::Rf64);
    assert_eq!(summary.frames, 8 * 64);
    assert_eq!(summary.sample_rate, Some(96_000));
}

#[test]
fn test_dual_tuner_with_gains_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), OutputType::Raw, "dual.iq");
    config.stream.dual_tuner = true;
    config.output.gains_file = true;
    config.source.gain_change_every = 2;
    let source = synthetic(&config, 7);

    let report = Session::new(config).unwrap().run(boxed(source)).unwrap();
    assert_eq!(report.status, StreamStatus::Done);
    assert_eq!(report.ingest.channels.len(), 2);
    assert_eq!(report.writer.output_samples, 7 * 64);
    assert_eq!(report.writer.data_size, 7 * 64 * 8);

    let summary = inspect::inspect_recording(report.output.as_ref().unwrap(), 2).unwrap();
    assert_eq!(summary.tuners, 2);
    // tuner B carries the mirrored tone
    assert_eq!(summary.levels[0].qmax, -summary.levels[1].qmin);

    let gains = inspect::read_gains(&report.gains.unwrap()).unwrap();
    let samples: Vec<u64> = gains.iter().map(|g| g.sample_num).collect();
    assert_eq!(samples, vec![3 * 64, 5 * 64, 7 * 64]);
    assert!(gains.iter().all(|g| g.tuner == 0));
}

#[test]
fn test_replay_reproduces_recording() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = config(dir.path(), OutputType::Raw, "first.iq");
    let source = synthetic(&recorded, 9);
    let first = Session::new(recorded.clone()).unwrap().run(boxed(source)).unwrap();
    let first_path = first.output.unwrap();

    let mut replay = config(dir.path(), OutputType::Raw, "replay.iq");
    replay.source.input = Some(first_path.clone());
    let source = FileSource::open(&first_path, DeviceInfo::from_config(&replay), 50, false).unwrap();
    let second = Session::new(replay).unwrap().run(Box::new(source)).unwrap();

    assert_eq!(
        std::fs::read(&first_path).unwrap(),
        std::fs::read(second.output.unwrap()).unwrap()
    );
}

#[test]
fn test_samples_buffer_too_small_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), OutputType::Raw, "small.iq");
    config.buffers.samples = 100;
    config.stream.zero_fill_max_samples = 0;
    let source = synthetic(&config, 4);

    let result = Session::new(config).unwrap().run(boxed(source));
    assert!(matches!(result, Err(SessionError::Stream(_))), "{result:?}");
}
