// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The deterministic time-and-count-driven schedule and tick state
//! machine (§4.1), grounded on the Python original's `Routine` class:
//! settings-matrix construction rules, then a non-blocking `tick()` that
//! the Supervisor drives at high frequency.

use std::time::{Duration, Instant};

use crate::config::RoutineParams;

pub const MAX_NUMBER_LIMIT: f64 = 5000.0;
pub const MAX_TIME_LIMIT_SECS: f64 = 345_600.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalMode {
    CaptureStart,
    CaptureEnd,
}

impl IntervalMode {
    fn parse(s: &str) -> IntervalMode {
        match s.to_lowercase().as_str() {
            "capture_start" => IntervalMode::CaptureStart,
            _ => IntervalMode::CaptureEnd,
        }
    }
}

/// One entry of the resolved settings matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Setting {
    pub integration_time_s: f64,
    pub gain_db: f64,
}

/// Builds the settings matrix from raw integration-time and gain vectors
/// per §4.1's Cartesian-product / broadcast / loop-or-truncate rules.
/// `repeat == 0` is resolved by the caller (it needs `number_limit` and
/// the base schedule length, which this function doesn't yet know before
/// building the base schedule).
fn build_base_schedule(
    integration_times: &[f64],
    gains: &[f64],
    all_combinations: bool,
    number_limit: u32,
    loop_integration_time: bool,
    loop_gain: bool,
) -> Vec<Setting> {
    if all_combinations {
        let unique_i = dedup_preserve_order(integration_times);
        let unique_g = dedup_preserve_order(gains);
        let mut out = Vec::with_capacity(unique_i.len() * unique_g.len());
        for &g in &unique_g {
            for &i in &unique_i {
                out.push(Setting { integration_time_s: i, gain_db: g });
            }
        }
        return out;
    }

    let mut i_vec = integration_times.to_vec();
    let mut g_vec = gains.to_vec();

    if i_vec.len() == 1 {
        if g_vec.len() > 1 {
            i_vec = vec![i_vec[0]; g_vec.len()];
        } else {
            i_vec = vec![i_vec[0]; number_limit.max(1) as usize];
        }
    }
    if g_vec.len() == 1 {
        g_vec = vec![g_vec[0]; i_vec.len()];
    }

    if g_vec.len() < i_vec.len() {
        if loop_gain {
            g_vec = tile_to_length(&g_vec, i_vec.len());
        } else {
            i_vec.truncate(g_vec.len());
        }
    } else if g_vec.len() > i_vec.len() {
        if loop_integration_time {
            i_vec = tile_to_length(&i_vec, g_vec.len());
        } else {
            g_vec.truncate(i_vec.len());
        }
    }

    i_vec
        .into_iter()
        .zip(g_vec)
        .map(|(integration_time_s, gain_db)| Setting { integration_time_s, gain_db })
        .collect()
}

fn dedup_preserve_order(values: &[f64]) -> Vec<f64> {
    let mut seen = Vec::new();
    for &v in values {
        if !seen.contains(&v) {
            seen.push(v);
        }
    }
    seen
}

fn tile_to_length(values: &[f64], length: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    (0..length).map(|i| values[i % values.len()]).collect()
}

/// Reasons a Routine can report `complete`, in termination-predicate order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Signalled,
    NumberLimit,
    TimeLimit,
    ScheduleExhausted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Signalled => "stop signal",
            StopReason::NumberLimit => "number limit",
            StopReason::TimeLimit => "time limit",
            StopReason::ScheduleExhausted => "schedule exhausted",
        }
    }
}

/// The outcome of one `tick()` call.
#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// Nothing to do this tick.
    Idle,
    /// A capture of this setting should be started now.
    StartCapture(Setting),
    /// The routine has finished; no more captures will be issued.
    Complete(StopReason),
}

/// A finite capture schedule plus the runtime tick state machine (§4.1,
/// §5). Mutation is confined to `tick()` and `advance_next_capture()`,
/// both called only from the Supervisor's tick thread, so no internal
/// synchronization is needed here — the Supervisor is responsible for
/// sharing `image_count`/`stop_signal`/etc. across threads (§5).
#[derive(Debug)]
pub struct Routine {
    pub name: String,
    pub initial_delay: Duration,
    pub number_limit: u32,
    pub time_limit: Duration,
    pub interval_mode: IntervalMode,
    pub interval: Duration,
    pub repeat_interval: Duration,
    pub min_tick_length: Duration,
    pub schedule: Vec<Setting>,
    base_schedule_len: usize,

    pub start_time: Option<Instant>,
    pub next_capture_at: Option<Instant>,
    pub image_count: u32,
    pub complete: bool,
    pub stop_signal: bool,
    pub stop_reason: Option<StopReason>,
    pub capturing_image: bool,
}

impl Routine {
    pub fn from_params(params: &RoutineParams) -> Self {
        let number_limit = params.number_limit.unwrap_or(MAX_NUMBER_LIMIT).clamp(0.0, MAX_NUMBER_LIMIT) as u32;
        let time_limit_secs = params.time_limit_secs.unwrap_or(MAX_TIME_LIMIT_SECS).min(MAX_TIME_LIMIT_SECS);

        let integration_times = params.integration_time_secs.clone().unwrap_or_else(|| vec![0.0]);
        let gains = params.gain.clone().unwrap_or_else(|| vec![1.0]);
        let all_combinations = params.all_combinations.unwrap_or(false);
        let loop_integration_time = params.loop_integration_time.unwrap_or(false);
        let loop_gain = params.loop_gain.unwrap_or(false);

        let base_schedule = build_base_schedule(
            &integration_times,
            &gains,
            all_combinations,
            number_limit,
            loop_integration_time,
            loop_gain,
        );
        let base_len = base_schedule.len().max(1);

        let repeat = match params.repeat {
            Some(r) if r != 0.0 => r as u32,
            _ => (number_limit as usize / base_len) as u32,
        };

        let mut schedule = Vec::with_capacity(base_schedule.len() * repeat as usize);
        for _ in 0..repeat {
            schedule.extend_from_slice(&base_schedule);
        }
        schedule.truncate(number_limit as usize);

        Routine {
            name: params.name.clone().unwrap_or_else(|| "routine".to_string()),
            initial_delay: Duration::from_secs_f64(params.initial_delay_time_secs.unwrap_or(0.0).max(0.0)),
            number_limit,
            time_limit: Duration::from_secs_f64(time_limit_secs),
            interval_mode: params.interval_mode.as_deref().map(IntervalMode::parse).unwrap_or(IntervalMode::CaptureEnd),
            interval: Duration::from_secs_f64(params.interval_time_secs.unwrap_or(0.0).max(0.0)),
            repeat_interval: Duration::from_secs_f64(params.repeat_interval_time_secs.unwrap_or(0.0).max(0.0)),
            min_tick_length: Duration::from_secs_f64(params.min_tick_length_secs.unwrap_or(0.01).max(0.0)),
            schedule,
            base_schedule_len: base_len,
            start_time: None,
            next_capture_at: None,
            image_count: 0,
            complete: false,
            stop_signal: false,
            stop_reason: None,
            capturing_image: false,
        }
    }

    /// Requests cooperative stop; takes effect once any in-flight capture
    /// finishes (§4.1 step 2a, §5 Cancellation).
    pub fn signal_stop(&mut self) {
        self.stop_signal = true;
    }

    /// Non-blocking; called from the Supervisor's tick thread at ≥100 Hz.
    /// Evaluates termination predicates in the fixed order of §4.1 step 2,
    /// then, if still running and due, returns a capture request.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.start_time.is_none() {
            self.start_time = Some(now);
            self.next_capture_at = Some(now + self.initial_delay);
        }
        let start_time = self.start_time.unwrap();

        if !self.complete {
            if self.stop_signal && !self.capturing_image {
                self.stop_reason.get_or_insert(StopReason::Signalled);
                self.complete = true;
            } else if self.image_count >= self.number_limit {
                self.stop_reason.get_or_insert(StopReason::NumberLimit);
                self.complete = !self.capturing_image;
            } else if now.saturating_duration_since(start_time) >= self.time_limit {
                self.stop_reason.get_or_insert(StopReason::TimeLimit);
                self.complete = !self.capturing_image;
            } else if self.image_count as usize >= self.schedule.len() {
                self.stop_reason.get_or_insert(StopReason::ScheduleExhausted);
                self.complete = !self.capturing_image;
            }
        }

        if self.complete {
            return TickOutcome::Complete(self.stop_reason.unwrap_or(StopReason::ScheduleExhausted));
        }

        let next_capture_at = self.next_capture_at.unwrap();
        if now >= next_capture_at && !self.capturing_image {
            let setting = self.schedule[self.image_count as usize];
            self.capturing_image = true;
            return TickOutcome::StartCapture(setting);
        }

        TickOutcome::Idle
    }

    /// Called by the capture worker once a capture completes (successfully
    /// or not) and has been accounted for; clears the in-flight flag and
    /// schedules the next capture time (§4.1 `advance_next_capture`).
    pub fn advance_next_capture(&mut self, now: Instant, persisted: bool) {
        self.capturing_image = false;
        let mut crossed_repeat_boundary = false;
        if persisted {
            self.image_count += 1;
            crossed_repeat_boundary =
                self.base_schedule_len > 0 && (self.image_count as usize).is_multiple_of(self.base_schedule_len);
        }
        let mut next = match self.interval_mode {
            IntervalMode::CaptureEnd => now + self.interval,
            IntervalMode::CaptureStart => self.next_capture_at.unwrap_or(now) + self.interval,
        };
        if crossed_repeat_boundary {
            next += self.repeat_interval;
        }
        self.next_capture_at = Some(next);
    }
}
