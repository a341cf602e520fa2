// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The tick-driven main loop (§4.5): couples the `Routine` state machine,
//! a capture worker thread, and the FIFO control channel. Modeled on this
//! codebase's worker-thread-around-shared-state shape (`DetectEngine`'s
//! `worker()` loop over a `Mutex`-guarded state and a `JoinHandle`), but
//! restructured around two plain FIFOs instead of a gRPC service per
//! SPEC_FULL.md §1 non-goals (the TUI's wire contract is fixed, not its
//! internals).

use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use canonical_error::CanonicalError;
use log::{error, info, warn};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::auto_exposure;
use crate::config::Config;
use crate::frame::{Environment, Frame};
use crate::routine::{Routine, Setting, TickOutcome};
use crate::sensor::{PressureSensor, RawFrame, SensorDriver, SensorMode};
use crate::session::{SessionHandle, SessionRecorder};

/// One failed frame fetch is retried up to this many times before the
/// capture is dropped silently (§7 item 3).
const FETCH_MAX_ATTEMPTS: u32 = 10;
/// Cadence of the outbound status frame and the temperature/depth log
/// line (§4.5).
const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const TEMPERATURE_LOG_INTERVAL: Duration = Duration::from_secs(300);
/// How many times "STOPPING" is written while waiting for the in-flight
/// capture to finish (§4.5).
const STOPPING_WRITE_ATTEMPTS: u32 = 10;
const STOPPING_WRITE_INTERVAL: Duration = Duration::from_millis(200);
/// Routine-level fatal threshold (§4.1, §7 item 2).
const MAX_CONSECUTIVE_TICK_ERRORS: u32 = 5;

fn seconds_to_us(seconds: f64) -> u64 {
    (seconds * 1_000_000.0).round().max(1.0) as u64
}

/// The narrow capture-port interface called for in SPEC_FULL.md §9
/// ("callback-style capture function injected into Routine" -> explicit
/// port), implemented here directly against the sensor/pressure driver
/// contracts rather than injected as a closure.
trait CapturePort {
    fn capture(&mut self, integration_time_us: u64, gain_db: f64, auto: bool) -> Result<Frame, CanonicalError>;
}

struct DriverCapturePort<'a> {
    sensor: &'a mut dyn SensorDriver,
    pressure: &'a mut dyn PressureSensor,
    mode: SensorMode,
    fetch_timeout_floor: Duration,
    /// Starting point for the next auto-exposure search, carried over
    /// from the previous accepted frame rather than reset each capture
    /// (mirrors this codebase's `prev_exposure_duration_secs` carry-over
    /// in `detect_engine.rs`'s auto-exposure loop).
    last_auto_integration_time_us: u64,
}

impl<'a> DriverCapturePort<'a> {
    fn fetch_timeout(&self, integration_time_us: u64) -> Duration {
        self.fetch_timeout_floor.max(Duration::from_micros(integration_time_us) + Duration::from_millis(500))
    }

    /// Attaches environmental readings (§3, §6): the pressure-sensor read
    /// retries once; on persistent failure the Frame fields are left
    /// `None` rather than a stale or fabricated value (§3's invariant is
    /// authoritative for what lands in the Frame; see DESIGN.md).
    fn attach_environment(&mut self, raw: &RawFrame) -> Environment {
        let mut read_ok = self.pressure.read().is_ok();
        if !read_ok {
            warn!("pressure sensor read failed; retrying once");
            read_ok = self.pressure.read().is_ok();
        }
        if !read_ok {
            warn!("pressure sensor read failed persistently; recording null environmental attachments");
            return Environment { depth_m: None, pressure_mbar: None, environment_temperature_c: None, sensor_temperature_c: Some(raw.ambient_temperature_c) };
        }
        Environment {
            depth_m: self.pressure.depth_m().ok(),
            pressure_mbar: self.pressure.pressure_mbar().ok(),
            environment_temperature_c: self.pressure.temperature_c().ok(),
            sensor_temperature_c: Some(raw.ambient_temperature_c),
        }
    }

    /// Commands the sensor to `us`, switching operating mode first if `us`
    /// falls outside the current mode's queryable range but within the
    /// other mode's (§4.2 Bounds, §6).
    fn command_integration_time(&mut self, us: u64) -> Result<(), CanonicalError> {
        let (min, max) = self.sensor.integration_time_range_us(self.mode);
        if us < min || us > max {
            let other = match self.mode {
                SensorMode::Default => SensorMode::LongExposure,
                SensorMode::LongExposure => SensorMode::Default,
            };
            let (other_min, other_max) = self.sensor.integration_time_range_us(other);
            if us >= other_min && us <= other_max {
                self.sensor.set_acquisition_mode(other)?;
                self.sensor.load_user_set(match other {
                    SensorMode::Default => "default",
                    SensorMode::LongExposure => "long_exposure",
                })?;
                self.mode = other;
            }
        }
        self.sensor.set_integration_time_us(us)
    }

    fn fetch_with_retries(&mut self, timeout: Duration) -> Result<RawFrame, CanonicalError> {
        let mut last_err = None;
        for attempt in 1..=FETCH_MAX_ATTEMPTS {
            match self.sensor.fetch_frame(timeout) {
                Ok(raw) => return Ok(raw),
                Err(e) => {
                    warn!("frame fetch attempt {attempt}/{FETCH_MAX_ATTEMPTS} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap())
    }
}

impl<'a> CapturePort for DriverCapturePort<'a> {
    fn capture(&mut self, integration_time_us: u64, gain_db: f64, auto: bool) -> Result<Frame, CanonicalError> {
        if auto {
            self.sensor.set_gain_db(gain_db)?;
            let seed = self.last_auto_integration_time_us;
            let timeout = self.fetch_timeout(seed);
            let outcome = auto_exposure::regulate(
                self.sensor,
                seed,
                gain_db,
                auto_exposure::DEFAULT_TARGET_SATURATION,
                auto_exposure::DEFAULT_MARGIN,
                timeout,
            )?;
            self.last_auto_integration_time_us = outcome.integration_time_us;
            let raw = RawFrame {
                width: outcome.width,
                height: outcome.height,
                pixels: outcome.pixels,
                pixel_format: outcome.pixel_format,
                sensor_time: outcome.timestamp,
                ambient_temperature_c: 0.0,
                effective_integration_time_us: outcome.integration_time_us,
            };
            let environment = self.attach_environment(&raw);
            let mut frame = Frame::new(raw.width, raw.height, raw.pixels, raw.pixel_format, raw.sensor_time, raw.effective_integration_time_us, gain_db, true);
            frame.environment = Environment { sensor_temperature_c: Some(raw.ambient_temperature_c), ..environment };
            return Ok(frame);
        }

        self.command_integration_time(integration_time_us)?;
        self.sensor.set_gain_db(gain_db)?;
        let timeout = self.fetch_timeout(integration_time_us);
        let raw = self.fetch_with_retries(timeout)?;
        let environment = self.attach_environment(&raw);
        let mut frame = Frame::new(raw.width, raw.height, raw.pixels, raw.pixel_format, raw.sensor_time, raw.effective_integration_time_us, gain_db, false);
        frame.environment = environment;
        Ok(frame)
    }
}

/// A message flowing from the tick thread to the capture worker.
enum CaptureCommand {
    Capture(Setting),
    Stop,
}

/// A message flowing from the capture worker back to the tick thread,
/// consumed by `Routine::advance_next_capture`.
struct CaptureCompletion {
    persisted: bool,
}

/// The FIFO control channel (§4.5, §6): a non-blocking inbound pipe for
/// `STOP`/free-form messages, and a best-effort outbound pipe for status
/// frames whose write failures are silently dropped (no reader is the
/// normal idle case, §7 item 5).
pub struct ControlChannel {
    in_fd: RawFd,
    out_path: PathBuf,
}

impl ControlChannel {
    /// Creates both FIFOs if missing, then opens the inbound one
    /// non-blocking for reading (§4.5 step 4).
    pub fn open(pipe_in: &Path, pipe_out: &Path) -> Result<Self, CanonicalError> {
        for path in [pipe_in, pipe_out] {
            if !path.exists() {
                mkfifo(path, Mode::from_bits_truncate(0o644))
                    .map_err(|e| canonical_error::internal_error(&format!("mkfifo {path:?} failed: {e}")))?;
            }
        }
        let in_fd = open(pipe_in, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(|e| canonical_error::internal_error(&format!("opening {pipe_in:?} failed: {e}")))?;
        Ok(ControlChannel { in_fd, out_path: pipe_out.to_path_buf() })
    }

    /// Non-blocking read of whatever is currently available. `Some("STOP")`
    /// requests cooperative stop; any other non-empty payload is a
    /// free-form message to log (§6).
    pub fn try_recv(&self) -> Option<String> {
        let mut buf = [0u8; 4096];
        match nix::unistd::read(self.in_fd, &mut buf) {
            Ok(0) | Err(_) => None,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
        }
    }

    /// Writes `text` to the outbound FIFO, silently dropping any failure
    /// (§7 item 5: the reader may not be attached — the normal idle case).
    pub fn send_status(&self, text: &str) {
        if let Ok(fd) = open(&self.out_path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()) {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let _ = nix::unistd::write(borrowed, text.as_bytes());
            let _ = nix::unistd::close(fd);
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.in_fd);
    }
}

fn format_runtime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Formats the outbound multiline status frame (§6).
fn format_status(routine_name: &str, session_name: &str, elapsed: Duration, image_count: usize, queue_length: usize, stopping: bool) -> String {
    let session_name_no_spaces = session_name.replace(' ', "_");
    let mut out = format!(
        "Routine: {routine_name}\nSession: {session_name_no_spaces}\nRuntime: {}\nImages Captured: {image_count}\nImage Save Queue Size: {queue_length}\n",
        format_runtime(elapsed)
    );
    if stopping {
        out.push_str("STOPPING\n");
    }
    out
}

fn capture_worker_loop(
    cmd_rx: Receiver<CaptureCommand>,
    done_tx: std::sync::mpsc::Sender<CaptureCompletion>,
    mut sensor: Box<dyn SensorDriver>,
    mut pressure: Box<dyn PressureSensor>,
    recorder: SessionHandle,
) {
    let mut port = DriverCapturePort {
        sensor: sensor.as_mut(),
        pressure: pressure.as_mut(),
        mode: SensorMode::Default,
        fetch_timeout_floor: Duration::from_secs(2),
        last_auto_integration_time_us: 10_000,
    };
    for cmd in cmd_rx {
        let setting = match cmd {
            CaptureCommand::Capture(setting) => setting,
            CaptureCommand::Stop => break,
        };
        let auto = setting.integration_time_s <= 0.0;
        let integration_time_us = seconds_to_us(setting.integration_time_s);
        match port.capture(integration_time_us, setting.gain_db, auto) {
            Ok(frame) => {
                recorder.push(frame);
                let _ = done_tx.send(CaptureCompletion { persisted: true });
            }
            Err(e) => {
                error!("capture failed after retries; dropping frame: {e}");
                let _ = done_tx.send(CaptureCompletion { persisted: false });
            }
        }
    }
    let _ = sensor.stop_acquisition();
}

/// Owns sensor lifecycle, Routine, Session, and the control channel; runs
/// the tick loop to completion (§4.5). Never blocks on capture or disk
/// I/O on the calling (tick) thread — both live on the capture worker and
/// the persistence worker respectively (§5).
///
/// `got_signal` is polled once per tick and treated exactly like an
/// inbound `STOP` control message, so a SIGINT requests the same
/// cooperative shutdown (finish in-flight capture, flush the queue,
/// write `STOPPING`) as the FIFO does.
pub fn run(
    config: &Config,
    mut routine: Routine,
    mut sensor: Box<dyn SensorDriver>,
    mut pressure: Box<dyn PressureSensor>,
    mut recorder: SessionRecorder,
    got_signal: Arc<AtomicBool>,
) -> Result<(), CanonicalError> {
    sensor.connect()?;
    pressure.init()?;

    let first = routine.schedule.first().copied().unwrap_or(Setting { integration_time_s: 0.01, gain_db: 1.0 });
    sensor.set_gain_db(1.0)?;
    sensor.set_acquisition_mode(SensorMode::Default)?;
    sensor.set_integration_time_us(seconds_to_us(first.integration_time_s.max(0.01)))?;
    sensor.start_acquisition()?;

    let control = ControlChannel::open(&config.pipe_in_file, &config.pipe_out_file)?;

    let (cmd_tx, cmd_rx) = sync_channel::<CaptureCommand>(1);
    let (done_tx, done_rx) = std::sync::mpsc::channel::<CaptureCompletion>();
    let handle = recorder.handle();
    let worker: JoinHandle<()> = std::thread::spawn(move || capture_worker_loop(cmd_rx, done_tx, sensor, pressure, handle));

    let start = Instant::now();
    let mut last_status = start;
    let mut last_temperature_log = start;
    let mut consecutive_errors = 0u32;

    loop {
        let now = Instant::now();
        let tick_result = run_one_iteration(
            &control,
            &mut routine,
            &config.session,
            &cmd_tx,
            &done_rx,
            &recorder,
            start,
            &mut last_status,
            &mut last_temperature_log,
            now,
            &got_signal,
        );

        match tick_result {
            Ok(()) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                error!("tick iteration error ({consecutive_errors}/{MAX_CONSECUTIVE_TICK_ERRORS}): {e}");
                if consecutive_errors >= MAX_CONSECUTIVE_TICK_ERRORS {
                    error!("{MAX_CONSECUTIVE_TICK_ERRORS} consecutive tick errors; aborting");
                    let _ = cmd_tx.send(CaptureCommand::Stop);
                    let _ = worker.join();
                    recorder.stop_processing_queue();
                    std::process::exit(1);
                }
            }
        }

        if routine.complete {
            break;
        }
        std::thread::sleep(routine.min_tick_length);
    }

    let _ = cmd_tx.send(CaptureCommand::Stop);
    let _ = worker.join();
    recorder.stop_processing_queue();
    info!("routine '{}' finished: {:?}", routine.name, routine.stop_reason);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_one_iteration(
    control: &ControlChannel,
    routine: &mut Routine,
    session_name: &str,
    cmd_tx: &SyncSender<CaptureCommand>,
    done_rx: &Receiver<CaptureCompletion>,
    recorder: &SessionRecorder,
    start: Instant,
    last_status: &mut Instant,
    last_temperature_log: &mut Instant,
    now: Instant,
    got_signal: &AtomicBool,
) -> Result<(), CanonicalError> {
    let stop_requested = match control.try_recv() {
        Some(message) if message == "STOP" => true,
        Some(message) => {
            info!("control message: {message}");
            false
        }
        None => false,
    };
    if stop_requested || got_signal.load(Ordering::Relaxed) {
        let first_time = !routine.stop_signal;
        if first_time {
            info!("received stop request (control message or interrupt signal)");
        }
        routine.signal_stop();
        // §4.5: write STOPPING up to 10 times at 0.2s intervals while
        // the in-flight capture (if any) finalizes. Blocking here is
        // the one documented exception to "never block the Supervisor
        // thread" (§5) — it only runs once, at the STOP edge.
        if first_time {
            for _ in 0..STOPPING_WRITE_ATTEMPTS {
                control.send_status("STOPPING\n");
                std::thread::sleep(STOPPING_WRITE_INTERVAL);
            }
        }
    }

    loop {
        match done_rx.try_recv() {
            Ok(completion) => routine.advance_next_capture(Instant::now(), completion.persisted),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }

    if now.duration_since(*last_temperature_log) >= TEMPERATURE_LOG_INTERVAL {
        *last_temperature_log = now;
        info!("periodic environmental snapshot (temperatures/depth recorded per-frame by the capture worker)");
    }

    if now.duration_since(*last_status) >= STATUS_INTERVAL {
        *last_status = now;
        let status = format_status(&routine.name, session_name, now.duration_since(start), recorder.image_count(), recorder.queue_len(), routine.stop_signal);
        control.send_status(&status);
    }

    match routine.tick(now) {
        TickOutcome::Idle => {}
        TickOutcome::StartCapture(setting) => {
            if cmd_tx.try_send(CaptureCommand::Capture(setting)).is_err() {
                return Err(canonical_error::internal_error("capture worker did not accept a new request"));
            }
        }
        TickOutcome::Complete(reason) => {
            info!("routine complete: {}", reason.as_str());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_runtime() {
        assert_eq!(format_runtime(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn test_format_status_includes_stopping_when_requested() {
        let status = format_status("r1", "my session", Duration::from_secs(5), 3, 1, true);
        assert!(status.contains("Routine: r1"));
        assert!(status.contains("Session: my_session"));
        assert!(status.contains("Images Captured: 3"));
        assert!(status.contains("Image Save Queue Size: 1"));
        assert!(status.contains("STOPPING"));
    }

    #[test]
    fn test_format_status_omits_stopping_when_not_requested() {
        let status = format_status("r1", "s1", Duration::from_secs(0), 0, 0, false);
        assert!(!status.contains("STOPPING"));
    }

    #[test]
    fn test_control_channel_round_trips_stop_message() {
        let dir = tempfile::tempdir().unwrap();
        let pipe_in = dir.path().join("in");
        let pipe_out = dir.path().join("out");
        let control = ControlChannel::open(&pipe_in, &pipe_out).unwrap();
        assert!(control.try_recv().is_none());

        let writer_fd = open(&pipe_in, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()).unwrap();
        let borrowed = unsafe { BorrowedFd::borrow_raw(writer_fd) };
        nix::unistd::write(borrowed, b"STOP").unwrap();
        nix::unistd::close(writer_fd).unwrap();

        assert_eq!(control.try_recv().as_deref(), Some("STOP"));
    }

    #[test]
    fn test_send_status_with_no_reader_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let pipe_in = dir.path().join("in");
        let pipe_out = dir.path().join("out");
        let control = ControlChannel::open(&pipe_in, &pipe_out).unwrap();
        control.send_status("Routine: r\n");
    }

    #[test]
    fn test_interrupt_signal_requests_cooperative_stop() {
        use crate::config::RoutineParams;
        use crate::session::Session;

        let dir = tempfile::tempdir().unwrap();
        let control = ControlChannel::open(&dir.path().join("in"), &dir.path().join("out")).unwrap();
        let params = RoutineParams { integration_time_secs: Some(vec![0.01]), number_limit: Some(1000.0), time_limit_secs: Some(1_000_000.0), ..Default::default() };
        let mut routine = Routine::from_params(&params);
        let (cmd_tx, _cmd_rx) = sync_channel::<CaptureCommand>(1);
        let (_done_tx, done_rx) = std::sync::mpsc::channel::<CaptureCompletion>();
        let session = Session::open_or_create(&dir.path().join("sessions"), "s").unwrap();
        let recorder = SessionRecorder::start(session);
        let got_signal = AtomicBool::new(true);
        let mut last_status = Instant::now() - STATUS_INTERVAL;
        let mut last_temperature_log = Instant::now();

        assert!(!routine.stop_signal);
        run_one_iteration(&control, &mut routine, "s", &cmd_tx, &done_rx, &recorder, Instant::now(), &mut last_status, &mut last_temperature_log, Instant::now(), &got_signal).unwrap();
        assert!(routine.stop_signal);
    }
}
