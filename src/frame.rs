// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The immutable `Frame` record created at capture time. See
//! SPEC_FULL.md §3 (Data model) and §9 ("Frame as a large
//! lazily-memoising object" re-architecture note): a Frame only holds raw
//! capture data; derived quantities live in `analysis::Analysis`.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use image::GrayImage;

use crate::sensor::PixelFormat;

/// Environmental readings attached once per Frame. Each field is `None`
/// only when the corresponding sensor read failed persistently (§3
/// invariant: never a stale value).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Environment {
    pub depth_m: Option<f64>,
    pub pressure_mbar: Option<f64>,
    pub environment_temperature_c: Option<f64>,
    pub sensor_temperature_c: Option<f64>,
}

/// An immutable record of one capture.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image_number: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub pixel_format: PixelFormat,
    pub timestamp: DateTime<Utc>,
    pub integration_time_us: u64,
    pub gain_db: f64,
    pub aperture: f64,
    pub auto: bool,
    pub environment: Environment,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        pixel_format: PixelFormat,
        timestamp: SystemTime,
        integration_time_us: u64,
        gain_db: f64,
        auto: bool,
    ) -> Self {
        Frame {
            image_number: None,
            width,
            height,
            pixels,
            pixel_format,
            timestamp: DateTime::<Utc>::from(timestamp),
            integration_time_us,
            gain_db,
            aperture: 1.0,
            auto,
            environment: Environment::default(),
        }
    }

    /// Returns a mono8 view of the raw pixel buffer. Valid only when
    /// `pixel_format == Mono8`.
    pub fn as_gray_image(&self) -> Option<GrayImage> {
        if self.pixel_format != PixelFormat::Mono8 {
            return None;
        }
        GrayImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    /// The public `info` map persisted to CSV/JSON/PNG text chunks: every
    /// key is a stable, ordered identifier; every value is string-ified.
    /// Order matters (§4.4: CSV columns are fixed from the first frame's
    /// key order).
    pub fn info(&self) -> Vec<(String, String)> {
        let mut info = Vec::with_capacity(12);
        info.push(("number".to_string(), self.image_number.map(|n| n.to_string()).unwrap_or_default()));
        info.push(("time".to_string(), self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()));
        info.push(("integration_time_us".to_string(), self.integration_time_us.to_string()));
        info.push(("gain_db".to_string(), format!("{:.3}", self.gain_db)));
        info.push(("aperture".to_string(), format!("{:.3}", self.aperture)));
        info.push(("auto".to_string(), self.auto.to_string()));
        info.push(("pixel_format".to_string(), format!("{:?}", self.pixel_format)));
        info.push(("width".to_string(), self.width.to_string()));
        info.push(("height".to_string(), self.height.to_string()));
        info.push(("depth_m".to_string(), optional_to_string(self.environment.depth_m)));
        info.push(("pressure_mbar".to_string(), optional_to_string(self.environment.pressure_mbar)));
        info.push((
            "environment_temperature_c".to_string(),
            optional_to_string(self.environment.environment_temperature_c),
        ));
        info.push((
            "sensor_temperature_c".to_string(),
            optional_to_string(self.environment.sensor_temperature_c),
        ));
        info
    }
}

fn optional_to_string(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.3}", v),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame() -> Frame {
        Frame::new(4, 4, vec![128; 16], PixelFormat::Mono8, SystemTime::now(), 100_000, 1.0, false)
    }

    #[test]
    fn test_info_is_ordered_and_complete() {
        let frame = test_frame();
        let info = frame.info();
        let keys: Vec<&str> = info.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys[0], "number");
        assert_eq!(keys[1], "time");
        assert!(keys.contains(&"depth_m"));
    }

    #[test]
    fn test_missing_environment_reads_are_blank_not_stale() {
        let frame = test_frame();
        let info = frame.info();
        let depth = info.iter().find(|(k, _)| k == "depth_m").unwrap();
        assert_eq!(depth.1, "");
    }

    #[test]
    fn test_as_gray_image_roundtrips_pixels() {
        let frame = test_frame();
        let gray = frame.as_gray_image().unwrap();
        assert_eq!(gray.get_pixel(0, 0).0[0], 128);
    }
}
