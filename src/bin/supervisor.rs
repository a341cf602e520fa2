// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The `triton-supervisor` binary (§4.5, §6): parses `--routine`/
//! `--session`, resolves the routine file, opens or creates the Session,
//! connects the sensor and pressure-sensor drivers, and runs the
//! Supervisor tick loop to completion or cooperative stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use triton_core::config::{parse_routine_file, Args, Config};
use triton_core::logging;
use triton_core::routine::Routine;
use triton_core::sensor::fakes::{FixedPressureSensor, MonotoneFakeCamera};
use triton_core::sensor::{PressureSensor, SensorDriver};
use triton_core::session::{Session, SessionRecorder};
use triton_core::supervisor;

fn main() {
    let args = Args::parse();

    let config = match Config::from_args_and_env(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("argument/environment error: {e}");
            std::process::exit(1);
        }
    };

    let _guards = logging::init(&config.data_directory, "error_log.log");

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal_handler = got_signal.clone();
    let _ = ctrlc::set_handler(move || {
        info!("received interrupt signal");
        got_signal_handler.store(true, Ordering::Relaxed);
    });

    let routine_path = match config.resolve_routine_path() {
        Ok(path) => path,
        Err(e) => {
            error!("routine '{}' not found: {e}", config.routine);
            std::process::exit(1);
        }
    };

    let contents = match std::fs::read_to_string(&routine_path) {
        Ok(c) => c,
        Err(e) => {
            error!("cannot read routine file {routine_path:?}: {e}");
            std::process::exit(1);
        }
    };
    let params = match parse_routine_file(&contents) {
        Ok(p) => p,
        Err(e) => {
            error!("cannot parse routine file {routine_path:?}: {e}");
            std::process::exit(1);
        }
    };
    let routine = Routine::from_params(&params);

    // The vendor sensor binding and the pressure-sensor binding are
    // external driver contracts (§1 Non-goals, §6); this build links the
    // in-memory fakes as the no-hardware-attached stand-in, the same role
    // this codebase's fallback `ImageCamera` plays when no real camera is
    // selected.
    let sensor: Box<dyn SensorDriver> = Box::new(MonotoneFakeCamera::new(640, 480, 1_000_000));
    let pressure: Box<dyn PressureSensor> = Box::new(FixedPressureSensor::default());

    let session = match Session::open_or_create(&config.sessions_dir(), &config.session) {
        Ok(session) => session,
        Err(e) => {
            error!("cannot open or create session '{}': {e}", config.session);
            std::process::exit(1);
        }
    };
    let recorder = SessionRecorder::start(session);

    info!("starting routine '{}' against session '{}'", routine.name, config.session);
    match supervisor::run(&config, routine, sensor, pressure, recorder, got_signal) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("supervisor loop failed: {e}");
            std::process::exit(1);
        }
    }
}
