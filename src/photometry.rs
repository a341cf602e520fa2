// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Photometric conversions: sRGB linearization, XYZ, relative and
//! unscaled absolute luminance, per IEC 61966-2-1:1999/AMD1:2003 §5.2 and
//! ISO 2720:1974.

/// sRGB -> linear-light transfer function (IEC 61966-2-1:1999/AMD1:2003 §5.2).
/// `c` is a normalized channel value in `[0, 1]`.
pub fn linearize_channel(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// The sRGB -> CIE 1931 XYZ conversion matrix (D65 white point).
const SRGB_TO_XYZ: [[f64; 3]; 3] = [
    [0.4124, 0.3576, 0.1805],
    [0.2126, 0.7152, 0.0722],
    [0.0193, 0.1192, 0.9505],
];

/// Converts a linear sRGB triple to CIE 1931 XYZ, returning `(X, Y, Z)`.
pub fn lin_srgb_to_xyz(rgb: [f64; 3]) -> (f64, f64, f64) {
    let mut xyz = [0.0; 3];
    for (row, out) in SRGB_TO_XYZ.iter().zip(xyz.iter_mut()) {
        *out = row[0] * rgb[0] + row[1] * rgb[1] + row[2] * rgb[2];
    }
    (xyz[0], xyz[1], xyz[2])
}

/// Normalizes an 8-bit channel value to `[0, 1]` and linearizes it. Callers
/// average this per masked pixel (not the other way around: per IEC
/// 61966-2-1, pixels are linearized *before* averaging).
pub fn normalize_and_linearize(value_0_255: f64) -> f64 {
    linearize_channel(value_0_255 / 255.0)
}

/// Relative luminance in `[0, 1]` from the masked per-channel means of
/// *already-linearized* pixel values (see `normalize_and_linearize`).
pub fn relative_luminance_rgb(linear_means: [f64; 3]) -> f64 {
    let (_, y, _) = lin_srgb_to_xyz(linear_means);
    y
}

/// Relative luminance for a monochrome frame: just the normalized masked mean.
pub fn relative_luminance_mono(mean: f64) -> f64 {
    mean / 255.0
}

/// Sensor speed in ISO, converted from a gain value in decibels. A gain of 0
/// dB is defined to correspond to ISO 100; roughly +6 dB doubles ISO.
pub fn iso_from_gain_db(gain_db: f64) -> f64 {
    100.0 * 10f64.powf(gain_db / 20.0)
}

/// Unscaled absolute luminance (ISO 2720:1974): `L * N^2 / (S * t)`, where
/// `relative_luminance` is `L`, `aperture` is the f-number `N`,
/// `integration_time_s` is `t` in seconds, and `iso_speed` is `S`. The
/// reflected-light-meter calibration constant `K` is intentionally omitted
/// (hence "unscaled").
pub fn unscaled_absolute_luminance(
    relative_luminance: f64,
    aperture: f64,
    integration_time_s: f64,
    iso_speed: f64,
) -> f64 {
    relative_luminance * (aperture * aperture) / (iso_speed * integration_time_s)
}
