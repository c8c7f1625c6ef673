//! Integration tests for the command line.

use assert_cmd::Command;
use predicates::prelude::*;

fn iq_recorder() -> Command {
    Command::cargo_bin("iq-recorder").unwrap()
}

fn write_raw(path: &std::path::Path, frames: usize) {
    let bytes: Vec<u8> = (0..frames)
        .flat_map(|k| {
            let i = (k % 100) as i16;
            [i, -i]
        })
        .flat_map(i16::to_ne_bytes)
        .collect();
    std::fs::write(path, bytes).unwrap();
}

#[test]
fn test_help_command() {
    iq_recorder()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("record"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("gains"));
}

#[test]
fn test_record_replay_then_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.iq");
    let output = dir.path().join("copy.wav");
    write_raw(&input, 1000);

    iq_recorder()
        .args(["record", "-W", "-x", "0", "--no-realtime", "--block-size", "100", "-r", "48000"])
        .arg("--input")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .assert()
        .success();

    iq_recorder()
        .arg("inspect")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("container = WAV"))
        .stdout(predicate::str::contains("samples = 1000"))
        .stdout(predicate::str::contains("tuner A I range = [0,99]"))
        .stdout(predicate::str::contains("tuner A Q range = [-99,0]"));
}

#[test]
fn test_inspect_raw_dual_tuner() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("dual.iq");
    write_raw(&input, 10);

    iq_recorder()
        .arg("inspect")
        .arg(&input)
        .args(["--channels", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("container = raw"))
        .stdout(predicate::str::contains("samples = 5"));
}

#[test]
fn test_wav_to_stdout_rejected() {
    iq_recorder()
        .args(["record", "-W", "-o", "-"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("stdout"));
}

#[test]
fn test_gains_listing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.iq");
    let output = dir.path().join("rec.iq");
    write_raw(&input, 400);

    iq_recorder()
        .args(["record", "-R", "-G", "-x", "0", "--no-realtime", "--block-size", "100"])
        .arg("--input")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .assert()
        .success();

    iq_recorder()
        .arg("gains")
        .arg(dir.path().join("rec.gains"))
        .assert()
        .success()
        .stdout(predicate::str::contains("0 gain changes"));
}

#[test]
fn test_missing_gains_file() {
    iq_recorder()
        .args(["gains", "/nonexistent/rec.gains"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading"));
}
