// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Narrow trait contracts for the sensor-vendor camera binding and the
//! pressure-sensor binding. These are interface boundaries only — driver
//! internals are out of scope (§1 Non-goals) — modeled on this codebase's
//! established shape for an external-collaborator contract (a small trait
//! whose fallible methods return `CanonicalError`).

use std::time::Duration;

use canonical_error::CanonicalError;

/// Pixel format declared by a captured frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PixelFormat {
    Mono8,
    BayerRggb8,
}

/// Sensor operating mode; crossing an integration-time range boundary
/// requires switching modes (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorMode {
    Default,
    LongExposure,
}

/// Raw data returned by a successful frame fetch.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub pixel_format: PixelFormat,
    /// Sensor-reported capture time (may differ slightly from host time).
    pub sensor_time: std::time::SystemTime,
    pub ambient_temperature_c: f64,
    /// The integration time the sensor actually used, as reported via its
    /// frame metadata (may differ from the commanded value while the sensor
    /// is still settling after a change).
    pub effective_integration_time_us: u64,
}

/// The sensor-vendor driver binding. A narrow capture-port interface:
/// exposure, gain, and frame fetch are the only operations the core
/// requires; everything else about the vendor SDK is out of scope.
pub trait SensorDriver: Send {
    fn connect(&mut self) -> Result<(), CanonicalError>;
    fn disconnect(&mut self) -> Result<(), CanonicalError>;

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CanonicalError>;
    fn set_integration_time_us(&mut self, us: u64) -> Result<(), CanonicalError>;
    fn set_gain_db(&mut self, gain_db: f64) -> Result<(), CanonicalError>;
    fn set_acquisition_mode(&mut self, mode: SensorMode) -> Result<(), CanonicalError>;

    fn start_acquisition(&mut self) -> Result<(), CanonicalError>;
    fn stop_acquisition(&mut self) -> Result<(), CanonicalError>;

    fn fetch_frame(&mut self, timeout: Duration) -> Result<RawFrame, CanonicalError>;

    fn load_user_set(&mut self, name: &str) -> Result<(), CanonicalError>;

    /// The queryable integration-time range for the given mode, in
    /// microseconds. Crossing outside the current mode's range requires a
    /// `set_acquisition_mode` + `load_user_set` switch.
    fn integration_time_range_us(&self, mode: SensorMode) -> (u64, u64);
}

/// The pressure-sensor driver binding (§6). Any read may fail; the
/// Frame-attachment call (see `supervisor::attach_environment`) retries
/// once and on persistent failure records 0.0 and logs a warning.
pub trait PressureSensor: Send {
    fn init(&mut self) -> Result<(), CanonicalError>;
    fn set_fluid_density(&mut self, kg_per_m3: f64) -> Result<(), CanonicalError>;
    fn read(&mut self) -> Result<(), CanonicalError>;
    fn depth_m(&self) -> Result<f64, CanonicalError>;
    fn pressure_mbar(&self) -> Result<f64, CanonicalError>;
    fn temperature_c(&self) -> Result<f64, CanonicalError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod fakes {
    //! In-memory fakes for the sensor contracts, used to drive deterministic
    //! tests without real hardware bindings (§10.4).
    use super::*;
    use std::time::SystemTime;

    /// A fake camera whose measured saturation is a monotone function of the
    /// commanded integration time, for exercising the auto-exposure
    /// convergence scenario (SPEC_FULL.md §8 scenario 5).
    pub struct MonotoneFakeCamera {
        pub width: u32,
        pub height: u32,
        pub pixel_format: PixelFormat,
        pub integration_time_us: u64,
        pub gain_db: f64,
        pub mode: SensorMode,
        /// Saturation fraction produced at `integration_time_us == full_scale_us`.
        pub full_scale_us: u64,
        pub connected: bool,
    }

    impl MonotoneFakeCamera {
        pub fn new(width: u32, height: u32, full_scale_us: u64) -> Self {
            MonotoneFakeCamera {
                width,
                height,
                pixel_format: PixelFormat::Mono8,
                integration_time_us: 1,
                gain_db: 1.0,
                mode: SensorMode::Default,
                full_scale_us,
                connected: false,
            }
        }

        /// Each pixel has its own "well capacity" spread across
        /// `[0.2, 1.0] * full_scale_us`, so the fraction of pixels reading
        /// above the saturation threshold grows continuously with
        /// integration time rather than flipping all-or-nothing — this is
        /// what lets the auto-exposure regulator converge on a target
        /// saturation *fraction* instead of a binary state. The spread is
        /// assigned via a Weyl (golden-ratio) sequence rather than by raw
        /// index so that any spatially local region of the image, such as
        /// the active-circle mask, still samples the full range instead of
        /// just a narrow band.
        fn pixels(&self) -> Vec<u8> {
            const GOLDEN_CONJUGATE: f64 = 0.6180339887498949;
            let n = (self.width * self.height) as usize;
            (0..n)
                .map(|i| {
                    let spread = 0.2 + 0.8 * ((i as f64 * GOLDEN_CONJUGATE) % 1.0);
                    let pixel_full_scale = self.full_scale_us as f64 * spread;
                    let ratio = self.integration_time_us as f64 / pixel_full_scale;
                    (ratio.clamp(0.0, 1.0) * 255.0) as u8
                })
                .collect()
        }
    }

    impl SensorDriver for MonotoneFakeCamera {
        fn connect(&mut self) -> Result<(), CanonicalError> {
            self.connected = true;
            Ok(())
        }
        fn disconnect(&mut self) -> Result<(), CanonicalError> {
            self.connected = false;
            Ok(())
        }
        fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CanonicalError> {
            self.pixel_format = format;
            Ok(())
        }
        fn set_integration_time_us(&mut self, us: u64) -> Result<(), CanonicalError> {
            self.integration_time_us = us;
            Ok(())
        }
        fn set_gain_db(&mut self, gain_db: f64) -> Result<(), CanonicalError> {
            self.gain_db = gain_db;
            Ok(())
        }
        fn set_acquisition_mode(&mut self, mode: SensorMode) -> Result<(), CanonicalError> {
            self.mode = mode;
            Ok(())
        }
        fn start_acquisition(&mut self) -> Result<(), CanonicalError> {
            Ok(())
        }
        fn stop_acquisition(&mut self) -> Result<(), CanonicalError> {
            Ok(())
        }
        fn fetch_frame(&mut self, _timeout: Duration) -> Result<RawFrame, CanonicalError> {
            let pixels = self.pixels();
            Ok(RawFrame {
                width: self.width,
                height: self.height,
                pixels,
                pixel_format: self.pixel_format,
                sensor_time: SystemTime::now(),
                ambient_temperature_c: 20.0,
                effective_integration_time_us: self.integration_time_us,
            })
        }
        fn load_user_set(&mut self, _name: &str) -> Result<(), CanonicalError> {
            Ok(())
        }
        fn integration_time_range_us(&self, _mode: SensorMode) -> (u64, u64) {
            (1, 10_000_000)
        }
    }

    /// A fake pressure sensor with fixed readings.
    pub struct FixedPressureSensor {
        pub depth_m: f64,
        pub pressure_mbar: f64,
        pub temperature_c: f64,
        pub fail: bool,
    }

    impl Default for FixedPressureSensor {
        fn default() -> Self {
            FixedPressureSensor {
                depth_m: 12.3,
                pressure_mbar: 2200.0,
                temperature_c: 8.5,
                fail: false,
            }
        }
    }

    impl PressureSensor for FixedPressureSensor {
        fn init(&mut self) -> Result<(), CanonicalError> {
            Ok(())
        }
        fn set_fluid_density(&mut self, _kg_per_m3: f64) -> Result<(), CanonicalError> {
            Ok(())
        }
        fn read(&mut self) -> Result<(), CanonicalError> {
            if self.fail {
                Err(canonical_error::unavailable_error("pressure sensor read failed"))
            } else {
                Ok(())
            }
        }
        fn depth_m(&self) -> Result<f64, CanonicalError> {
            Ok(self.depth_m)
        }
        fn pressure_mbar(&self) -> Result<f64, CanonicalError> {
            Ok(self.pressure_mbar)
        }
        fn temperature_c(&self) -> Result<f64, CanonicalError> {
            Ok(self.temperature_c)
        }
    }
}
