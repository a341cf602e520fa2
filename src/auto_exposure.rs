// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The closed-loop integration-time regulator (§4.2). Given a measured
//! saturation fraction, proposes the next integration time; the capture
//! worker drives the loop against the sensor contract until convergence
//! or the iteration budget is exhausted, the way this codebase's
//! `DetectEngine` drives its exposure correction-factor loop.

use std::time::Duration;

use log::warn;

use crate::analysis::Analysis;
use crate::frame::Frame;
use crate::sensor::SensorDriver;

/// Default target active-circle saturation fraction and acceptance margin.
pub const DEFAULT_TARGET_SATURATION: f64 = 0.01;
pub const DEFAULT_MARGIN: f64 = 0.005;
/// Regulator iteration cap (§4.2: "cap the regulator at a sensible
/// iteration limit").
pub const MAX_ITERATIONS: u32 = 20;
/// A refetched frame is discarded if its actual integration time differs
/// from the commanded value by more than this fraction (sensor warm-up).
const SETTLING_TOLERANCE: f64 = 0.10;

/// Proposes the next integration time from the measured saturation
/// fraction: `new_t = current_t * clamp(1 - (sat - target) / target, 0.1, 10)`.
pub fn next_integration_time_us(current_us: u64, saturation_fraction: f64, target: f64) -> u64 {
    let correction = (1.0 - (saturation_fraction - target) / target).clamp(0.1, 10.0);
    ((current_us as f64) * correction).round().max(1.0) as u64
}

/// Runs the auto-exposure loop against a `SensorDriver`, fetching frames
/// until the active-circle saturation fraction is within `margin` of
/// `target`, or `MAX_ITERATIONS` is reached. Returns the raw pixel buffer,
/// pixel format, and effective integration time of the accepted frame,
/// plus whether it actually converged (`correct_saturation`).
pub struct AutoExposureOutcome {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: crate::sensor::PixelFormat,
    pub integration_time_us: u64,
    pub gain_db: f64,
    pub timestamp: std::time::SystemTime,
    pub correct_saturation: bool,
}

pub fn regulate(
    sensor: &mut dyn SensorDriver,
    initial_integration_time_us: u64,
    gain_db: f64,
    target: f64,
    margin: f64,
    fetch_timeout: Duration,
) -> Result<AutoExposureOutcome, canonical_error::CanonicalError> {
    let mut commanded_us = initial_integration_time_us;
    let mut last_raw = None;

    for _ in 0..MAX_ITERATIONS {
        sensor.set_integration_time_us(commanded_us)?;
        let raw = sensor.fetch_frame(fetch_timeout)?;

        let settled = raw.effective_integration_time_us as f64;
        if (settled - commanded_us as f64).abs() / commanded_us as f64 > SETTLING_TOLERANCE {
            // Sensor still warming up to the commanded value; refetch.
            continue;
        }

        let frame = Frame::new(
            raw.width,
            raw.height,
            raw.pixels.clone(),
            raw.pixel_format,
            raw.sensor_time,
            raw.effective_integration_time_us,
            gain_db,
            true,
        );
        let analysis = Analysis::new(&frame).with_target_saturation(target, margin);
        let sat = analysis.inner().saturation_fraction;

        if (sat - target).abs() <= margin {
            return Ok(AutoExposureOutcome {
                pixels: raw.pixels,
                width: raw.width,
                height: raw.height,
                pixel_format: raw.pixel_format,
                integration_time_us: raw.effective_integration_time_us,
                gain_db,
                timestamp: raw.sensor_time,
                correct_saturation: true,
            });
        }

        commanded_us = next_integration_time_us(commanded_us, sat, target);
        last_raw = Some((raw, sat));
    }

    warn!("auto-exposure regulator did not converge within {MAX_ITERATIONS} iterations");
    match last_raw {
        Some((raw, _)) => Ok(AutoExposureOutcome {
            pixels: raw.pixels,
            width: raw.width,
            height: raw.height,
            pixel_format: raw.pixel_format,
            integration_time_us: raw.effective_integration_time_us,
            gain_db,
            timestamp: raw.sensor_time,
            correct_saturation: false,
        }),
        None => Err(canonical_error::deadline_exceeded_error(
            "auto-exposure regulator never obtained a settled frame",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::fakes::MonotoneFakeCamera;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_next_integration_time_increases_when_undersaturated() {
        let next = next_integration_time_us(100_000, 0.0, DEFAULT_TARGET_SATURATION);
        assert!(next > 100_000);
    }

    #[test]
    fn test_next_integration_time_decreases_when_oversaturated() {
        let next = next_integration_time_us(100_000, 1.0, DEFAULT_TARGET_SATURATION);
        assert!(next < 100_000);
    }

    #[test]
    fn test_next_integration_time_clamped_to_tenfold() {
        // An extreme overshoot should still clamp the correction factor to 0.1x.
        let next = next_integration_time_us(100_000, 100.0, DEFAULT_TARGET_SATURATION);
        assert_abs_diff_eq!(next as f64, 10_000.0, epsilon = 1.0);
    }

    #[test]
    fn test_regulate_converges_on_monotone_fake_sensor() {
        let mut camera = MonotoneFakeCamera::new(40, 40, 1_000_000);
        let outcome = regulate(&mut camera, 50_000, 1.0, DEFAULT_TARGET_SATURATION, DEFAULT_MARGIN, Duration::from_secs(1))
            .expect("regulator should produce a frame");
        assert!(outcome.correct_saturation);
    }
}
