// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! End-to-end scenarios seeded by SPEC_FULL.md §8, run against the
//! in-memory `SensorDriver`/`PressureSensor` fakes instead of real
//! hardware, the way `easternanemone-rudaq`'s top-level `tests/`
//! directory exercises its pool allocator against synthetic load.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use triton_core::config::{Config, RoutineParams};
use triton_core::routine::Routine;
use triton_core::sensor::fakes::{FixedPressureSensor, MonotoneFakeCamera};
use triton_core::sensor::{PressureSensor, SensorDriver};
use triton_core::session::{Session, SessionRecorder};
use triton_core::supervisor;

fn routine_params(overrides: impl FnOnce(&mut RoutineParams)) -> RoutineParams {
    let mut p = RoutineParams::default();
    p.min_tick_length_secs = Some(0.001);
    overrides(&mut p);
    p
}

fn test_config(dir: &std::path::Path, session: &str) -> Config {
    Config {
        routine: "unused".to_string(),
        session: session.to_string(),
        data_directory: dir.to_path_buf(),
        pipe_in_file: dir.join("pipe_in"),
        pipe_out_file: dir.join("pipe_out"),
        producer_path: None,
    }
}

/// Scenario 3: number-limit stop reason, and that the session on disk
/// ends up with exactly as many images as captures taken.
#[test]
fn scenario_number_limit_stops_engine_with_matching_session() {
    let dir = tempfile::tempdir().unwrap();
    let params = routine_params(|p| {
        p.integration_time_secs = Some(vec![0.01]);
        p.number_limit = Some(3.0);
        p.time_limit_secs = Some(1_000_000.0);
    });
    let routine = Routine::from_params(&params);

    let config = test_config(dir.path(), "number_limit_session");
    let sensor: Box<dyn SensorDriver> = Box::new(MonotoneFakeCamera::new(64, 64, 1_000_000));
    let pressure: Box<dyn PressureSensor> = Box::new(FixedPressureSensor::default());
    let session = Session::open_or_create(&config.sessions_dir(), &config.session).unwrap();
    let recorder = SessionRecorder::start(session);

    supervisor::run(&config, routine, sensor, pressure, recorder, Arc::new(AtomicBool::new(false))).unwrap();

    let manifest_path = config.sessions_dir().join("number_limit_session").join("session.json");
    let manifest: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["images"].as_array().unwrap().len(), 3);
}

/// Scenario 4: a short time limit stops the routine well before its
/// number_limit is reached.
#[test]
fn scenario_time_limit_stops_before_number_limit() {
    let dir = tempfile::tempdir().unwrap();
    let params = routine_params(|p| {
        p.integration_time_secs = Some(vec![0.01]);
        p.number_limit = Some(1000.0);
        p.time_limit_secs = Some(0.3);
    });
    let routine = Routine::from_params(&params);

    let config = test_config(dir.path(), "time_limit_session");
    let sensor: Box<dyn SensorDriver> = Box::new(MonotoneFakeCamera::new(64, 64, 1_000_000));
    let pressure: Box<dyn PressureSensor> = Box::new(FixedPressureSensor::default());
    let session = Session::open_or_create(&config.sessions_dir(), &config.session).unwrap();
    let recorder = SessionRecorder::start(session);

    supervisor::run(&config, routine, sensor, pressure, recorder, Arc::new(AtomicBool::new(false))).unwrap();

    let manifest_path = config.sessions_dir().join("time_limit_session").join("session.json");
    let manifest: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
    assert!(manifest["images"].as_array().unwrap().len() < 1000);
}

/// Scenario 5: auto-exposure convergence inside a full run — every
/// persisted frame with `auto = 1` settles within margin of the target
/// saturation fraction.
#[test]
fn scenario_auto_exposure_frames_converge() {
    let dir = tempfile::tempdir().unwrap();
    let params = routine_params(|p| {
        p.integration_time_secs = Some(vec![0.0]);
        p.number_limit = Some(2.0);
        p.time_limit_secs = Some(1_000_000.0);
    });
    let routine = Routine::from_params(&params);

    let config = test_config(dir.path(), "auto_exposure_session");
    let sensor: Box<dyn SensorDriver> = Box::new(MonotoneFakeCamera::new(200, 200, 1_000_000));
    let pressure: Box<dyn PressureSensor> = Box::new(FixedPressureSensor::default());
    let session = Session::open_or_create(&config.sessions_dir(), &config.session).unwrap();
    let recorder = SessionRecorder::start(session);

    supervisor::run(&config, routine, sensor, pressure, recorder, Arc::new(AtomicBool::new(false))).unwrap();

    let manifest_path = config.sessions_dir().join("auto_exposure_session").join("session.json");
    let manifest: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
    let images = manifest["images"].as_array().unwrap();
    assert_eq!(images.len(), 2);
    for image in images {
        let fields = image.as_array().unwrap();
        let get = |key: &str| {
            fields
                .iter()
                .find(|kv| kv[0] == key)
                .map(|kv| kv[1].as_str().unwrap().to_string())
                .unwrap()
        };
        assert_eq!(get("auto"), "true");
        let sat: f64 = get("inner_saturation_fraction").parse().unwrap();
        assert!((sat - 0.01).abs() <= 0.005, "saturation {sat} did not converge");
    }
}

/// Scenario 6: cooperative stop over the FIFO control channel finishes
/// any in-flight capture, flushes the queue, and exits cleanly with a
/// session shorter than the full routine length.
#[test]
fn scenario_cooperative_stop_via_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let params = routine_params(|p| {
        p.integration_time_secs = Some(vec![0.01]);
        p.number_limit = Some(1000.0);
        p.time_limit_secs = Some(1_000_000.0);
    });
    let routine = Routine::from_params(&params);

    let config = test_config(dir.path(), "cooperative_stop_session");
    let sensor: Box<dyn SensorDriver> = Box::new(MonotoneFakeCamera::new(64, 64, 1_000_000));
    let pressure: Box<dyn PressureSensor> = Box::new(FixedPressureSensor::default());
    let session = Session::open_or_create(&config.sessions_dir(), &config.session).unwrap();
    let recorder = SessionRecorder::start(session);

    let pipe_in = config.pipe_in_file.clone();
    let run_config = config.clone();
    let handle = std::thread::spawn(move || supervisor::run(&run_config, routine, sensor, pressure, recorder, Arc::new(AtomicBool::new(false))));

    // Give the engine a moment to create the FIFOs and capture a few
    // frames before requesting a stop.
    std::thread::sleep(Duration::from_millis(200));
    for _ in 0..20 {
        if pipe_in.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let fd = nix::fcntl::open(&pipe_in, nix::fcntl::OFlag::O_WRONLY, nix::sys::stat::Mode::empty()).unwrap();
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    nix::unistd::write(borrowed, b"STOP").unwrap();
    nix::unistd::close(fd).unwrap();

    handle.join().unwrap().unwrap();

    let manifest_path = config.sessions_dir().join("cooperative_stop_session").join("session.json");
    let manifest: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
    let count = manifest["images"].as_array().unwrap().len();
    assert!(count > 0, "expected at least one capture before stop");
    assert!(count < 1000, "stop should have short-circuited the full routine");
}
