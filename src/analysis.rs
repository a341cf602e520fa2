// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Lazy, idempotent derivation of photometric statistics from a raw
//! `Frame`. See SPEC_FULL.md §4.3 and §9: an `Analysis` wraps a `Frame`
//! and caches each derived quantity in a `OnceCell` the first time it is
//! demanded, so repeated reads (CSV row, PNG text chunk, JSON summary)
//! never redo the work and never trigger hidden I/O.

use std::cell::OnceCell;

use image::{Rgb, RgbImage};

use crate::frame::Frame;
use crate::mask::MaskPlan;
use crate::photometry;
use crate::sensor::PixelFormat;

/// The demosaic method recorded against a derived RGB view. Only
/// `AverageGreens` is implemented; the others are named so that a chosen
/// method is always declared in metadata, per §4.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DemosaicMethod {
    AverageGreens,
    Bilinear,
    Malvar2004,
    Menon2007,
    Menon2007Refined,
}

impl DemosaicMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DemosaicMethod::AverageGreens => "average_greens",
            DemosaicMethod::Bilinear => "bilinear",
            DemosaicMethod::Malvar2004 => "malvar",
            DemosaicMethod::Menon2007 => "menon",
            DemosaicMethod::Menon2007Refined => "menon_r",
        }
    }
}

/// Debayers an 8-bit RGGB CFA buffer by the average-greens method: the CFA
/// is split into four per-channel subarrays at half resolution, the two
/// green subarrays are averaged, and the result is a half-resolution RGB
/// image. Panics if `width` or `height` is odd (an RGGB 2x2 pattern
/// requires even dimensions).
pub fn demosaic_average_greens(width: u32, height: u32, pixels: &[u8]) -> RgbImage {
    assert_eq!(width % 2, 0, "RGGB demosaic requires even width");
    assert_eq!(height % 2, 0, "RGGB demosaic requires even height");
    let out_w = width / 2;
    let out_h = height / 2;
    let mut out = RgbImage::new(out_w, out_h);
    for oy in 0..out_h {
        for ox in 0..out_w {
            let x = ox * 2;
            let y = oy * 2;
            let r = pixels[(y * width + x) as usize];
            let g1 = pixels[(y * width + x + 1) as usize];
            let g2 = pixels[((y + 1) * width + x) as usize];
            let b = pixels[((y + 1) * width + x + 1) as usize];
            let g = ((g1 as u16 + g2 as u16) / 2) as u8;
            out.put_pixel(ox, oy, Rgb([r, g, b]));
        }
    }
    out
}

/// Masked stats over a single region: per-channel mean and saturation
/// fraction (fraction of masked pixels strictly above `threshold`).
#[derive(Clone, Debug, PartialEq)]
pub struct RegionStats {
    pub means: Vec<f64>,
    pub saturation_fraction: f64,
}

fn masked_region_stats_rgb(image: &RgbImage, mask: &image::GrayImage, threshold: u8) -> RegionStats {
    let mut sums = [0f64; 3];
    let mut count = 0u64;
    let mut saturated = 0u64;
    for (px, mpx) in image.pixels().zip(mask.pixels()) {
        if mpx.0[0] == 0 {
            continue;
        }
        count += 1;
        for (c, sum) in sums.iter_mut().enumerate() {
            *sum += px.0[c] as f64;
        }
        if px.0.iter().any(|&v| v > threshold) {
            saturated += 1;
        }
    }
    let means = if count == 0 {
        vec![0.0; 3]
    } else {
        sums.iter().map(|s| round3(s / count as f64)).collect()
    };
    let saturation_fraction = if count == 0 { 0.0 } else { saturated as f64 / count as f64 };
    RegionStats { means, saturation_fraction }
}

fn masked_region_stats_gray(image: &image::GrayImage, mask: &image::GrayImage, threshold: u8) -> RegionStats {
    let mut sum = 0f64;
    let mut count = 0u64;
    let mut saturated = 0u64;
    for (px, mpx) in image.pixels().zip(mask.pixels()) {
        if mpx.0[0] == 0 {
            continue;
        }
        count += 1;
        sum += px.0[0] as f64;
        if px.0[0] > threshold {
            saturated += 1;
        }
    }
    let means = if count == 0 { vec![0.0] } else { vec![round3(sum / count as f64)] };
    let saturation_fraction = if count == 0 { 0.0 } else { saturated as f64 / count as f64 };
    RegionStats { means, saturation_fraction }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// A view over a `Frame` that lazily derives and caches photometric
/// statistics. No field is computed until first demanded.
pub struct Analysis<'a> {
    frame: &'a Frame,
    saturation_threshold: u8,
    target_saturation_fraction: f64,
    target_saturation_margin: f64,
    demosaic_method: DemosaicMethod,

    rgb_view: OnceCell<Option<RgbImage>>,
    mask_plan: OnceCell<MaskPlan>,
    inner_stats: OnceCell<RegionStats>,
    outer_stats: OnceCell<RegionStats>,
    corner_stats: OnceCell<RegionStats>,
    concentric_stats: OnceCell<Vec<RegionStats>>,
    relative_luminance: OnceCell<f64>,
    absolute_luminance: OnceCell<f64>,
}

impl<'a> Analysis<'a> {
    pub fn new(frame: &'a Frame) -> Self {
        Analysis {
            frame,
            saturation_threshold: 250,
            target_saturation_fraction: 0.01,
            target_saturation_margin: 0.005,
            demosaic_method: DemosaicMethod::AverageGreens,
            rgb_view: OnceCell::new(),
            mask_plan: OnceCell::new(),
            inner_stats: OnceCell::new(),
            outer_stats: OnceCell::new(),
            corner_stats: OnceCell::new(),
            concentric_stats: OnceCell::new(),
            relative_luminance: OnceCell::new(),
            absolute_luminance: OnceCell::new(),
        }
    }

    pub fn with_target_saturation(mut self, fraction: f64, margin: f64) -> Self {
        self.target_saturation_fraction = fraction;
        self.target_saturation_margin = margin;
        self
    }

    pub fn demosaic_method(&self) -> DemosaicMethod {
        self.demosaic_method
    }

    /// The RGB view of the frame: `Some` for Bayer frames (demosaiced) or
    /// already-RGB frames; `None` for Mono8, which has no colour channels.
    fn rgb_view(&self) -> Option<&RgbImage> {
        self.rgb_view
            .get_or_init(|| match self.frame.pixel_format {
                PixelFormat::BayerRggb8 => Some(demosaic_average_greens(self.frame.width, self.frame.height, &self.frame.pixels)),
                PixelFormat::Mono8 => None,
            })
            .as_ref()
    }

    fn mask_plan(&self) -> &MaskPlan {
        self.mask_plan.get_or_init(|| {
            let (width, height) = match self.rgb_view() {
                Some(rgb) => (rgb.width(), rgb.height()),
                None => (self.frame.width, self.frame.height),
            };
            MaskPlan::default_for_size(width, height)
        })
    }

    fn region_stats(&self, mask: &image::GrayImage) -> RegionStats {
        match self.rgb_view() {
            Some(rgb) => masked_region_stats_rgb(rgb, mask, self.saturation_threshold),
            None => {
                let gray = self.frame.as_gray_image().expect("mono8 frame must yield a gray image");
                masked_region_stats_gray(&gray, mask, self.saturation_threshold)
            }
        }
    }

    /// Per-channel means and saturation fraction inside the active circle.
    pub fn inner(&self) -> &RegionStats {
        self.inner_stats.get_or_init(|| {
            let mask = self.mask_plan().active_circle.clone();
            self.region_stats(&mask)
        })
    }

    /// Per-channel means and saturation fraction in the outer annulus.
    pub fn outer(&self) -> &RegionStats {
        self.outer_stats.get_or_init(|| {
            let mask = self.mask_plan().outer_annulus.clone();
            self.region_stats(&mask)
        })
    }

    /// Per-channel means and saturation fraction in the four corner discs.
    pub fn corner(&self) -> &RegionStats {
        self.corner_stats.get_or_init(|| {
            let mask = self.mask_plan().corner_discs.clone();
            self.region_stats(&mask)
        })
    }

    /// Saturation fraction for each concentric annulus, ordered from the
    /// active radius outward.
    pub fn concentric_saturation_fractions(&self) -> &[RegionStats] {
        self.concentric_stats.get_or_init(|| {
            let masks = self.mask_plan().concentric_annuli.clone();
            masks.iter().map(|m| self.region_stats(m)).collect()
        })
    }

    /// Relative luminance in `[0, 1]`: for RGB frames, the sRGB→XYZ `Y`
    /// component of per-channel masked means linearized before averaging
    /// (IEC 61966-2-1/AMD1:2003 §5.2); for Mono8, the masked mean / 255.
    pub fn relative_luminance(&self) -> f64 {
        *self.relative_luminance.get_or_init(|| match self.rgb_view() {
            Some(rgb) => {
                let mask = self.mask_plan().active_circle.clone();
                let linear_means = masked_linear_means_rgb(rgb, &mask);
                photometry::relative_luminance_rgb(linear_means)
            }
            None => {
                let mean = self.inner().means[0];
                photometry::relative_luminance_mono(mean)
            }
        })
    }

    /// Unscaled absolute luminance (ISO 2720:1974): `L·N²/(S·t)`, where `S`
    /// is derived from the frame's gain in dB.
    pub fn absolute_luminance(&self) -> f64 {
        *self.absolute_luminance.get_or_init(|| {
            let l = self.relative_luminance();
            let iso = photometry::iso_from_gain_db(self.frame.gain_db);
            let integration_time_s = self.frame.integration_time_us as f64 / 1_000_000.0;
            photometry::unscaled_absolute_luminance(l, self.frame.aperture, integration_time_s, iso)
        })
    }

    /// Whether the active-circle saturation fraction is within
    /// `target_saturation_margin` of `target_saturation_fraction`.
    pub fn correct_saturation(&self) -> bool {
        (self.inner().saturation_fraction - self.target_saturation_fraction).abs() <= self.target_saturation_margin
    }

    /// Names `values` per channel (`{name}_R`, `{name}_G`, `{name}_B` for a
    /// demosaiced RGB view, bare `{name}` for Mono8), matching the
    /// original's `add_channels` naming.
    fn add_channels(&self, name: &str, values: &[f64]) -> Vec<(String, String)> {
        if self.rgb_view().is_some() {
            const CHANNELS: [&str; 3] = ["R", "G", "B"];
            values.iter().zip(CHANNELS).map(|(v, c)| (format!("{name}_{c}"), format!("{v:.3}"))).collect()
        } else {
            vec![(name.to_string(), format!("{:.3}", values[0]))]
        }
    }

    /// The derived-stats fields to merge with `Frame::info()` before
    /// persistence (§4.4), in a fixed order.
    pub fn info(&self) -> Vec<(String, String)> {
        let mut info = Vec::with_capacity(14 + self.concentric_saturation_fractions().len());
        info.push(("demosaic_method".to_string(), self.demosaic_method.as_str().to_string()));
        info.push(("inner_saturation_fraction".to_string(), format!("{:.3}", self.inner().saturation_fraction)));
        info.push(("outer_saturation_fraction".to_string(), format!("{:.3}", self.outer().saturation_fraction)));
        info.push(("corner_saturation_fraction".to_string(), format!("{:.3}", self.corner().saturation_fraction)));
        info.push(("correct_saturation".to_string(), self.correct_saturation().to_string()));
        info.push(("relative_luminance".to_string(), format!("{:.6}", self.relative_luminance())));
        info.push(("absolute_luminance".to_string(), format!("{:.6}", self.absolute_luminance())));
        info.extend(self.add_channels("inner_pixel_averages", &self.inner().means));
        info.extend(self.add_channels("outer_pixel_averages", &self.outer().means));
        info.extend(self.add_channels("corner_pixel_averages", &self.corner().means));
        for (i, stats) in self.concentric_saturation_fractions().iter().enumerate() {
            info.push((format!("concentric_saturation_fraction_{i}"), format!("{:.3}", stats.saturation_fraction)));
        }
        info
    }
}

fn masked_linear_means_rgb(image: &RgbImage, mask: &image::GrayImage) -> [f64; 3] {
    let mut sums = [0f64; 3];
    let mut count = 0u64;
    for (px, mpx) in image.pixels().zip(mask.pixels()) {
        if mpx.0[0] == 0 {
            continue;
        }
        count += 1;
        for (c, sum) in sums.iter_mut().enumerate() {
            *sum += photometry::normalize_and_linearize(px.0[c] as f64);
        }
    }
    if count == 0 {
        return [0.0; 3];
    }
    [sums[0] / count as f64, sums[1] / count as f64, sums[2] / count as f64]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::PixelFormat;
    use approx::assert_abs_diff_eq;
    use std::time::SystemTime;

    fn bayer_frame(width: u32, height: u32, r: u8, g: u8, b: u8) -> Frame {
        let mut pixels = vec![0u8; (width * height) as usize];
        for y in 0..height {
            for x in 0..width {
                let value = match (x % 2, y % 2) {
                    (0, 0) => r,
                    (1, 1) => b,
                    _ => g,
                };
                pixels[(y * width + x) as usize] = value;
            }
        }
        Frame::new(width, height, pixels, PixelFormat::BayerRggb8, SystemTime::now(), 10_000, 1.0, false)
    }

    fn mono_frame(width: u32, height: u32, value: u8) -> Frame {
        Frame::new(width, height, vec![value; (width * height) as usize], PixelFormat::Mono8, SystemTime::now(), 10_000, 1.0, false)
    }

    #[test]
    fn test_demosaic_average_greens_half_resolution() {
        let rgb = demosaic_average_greens(4, 4, &[1, 2, 1, 2, 3, 4, 3, 4, 1, 2, 1, 2, 3, 4, 3, 4]);
        assert_eq!((rgb.width(), rgb.height()), (2, 2));
    }

    #[test]
    fn test_demosaic_average_greens_pixel_values() {
        // A single 2x2 RGGB block: R=10, G1=20, G2=30, B=40.
        let rgb = demosaic_average_greens(2, 2, &[10, 20, 30, 40]);
        let px = rgb.get_pixel(0, 0);
        assert_eq!(px.0, [10, 25, 40]);
    }

    #[test]
    fn test_mono_relative_luminance_is_normalized_mean() {
        let frame = mono_frame(40, 40, 128);
        let analysis = Analysis::new(&frame);
        assert_abs_diff_eq!(analysis.relative_luminance(), 128.0 / 255.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bayer_inner_region_means_reflect_channel_values() {
        let frame = bayer_frame(200, 200, 10, 20, 40);
        let analysis = Analysis::new(&frame);
        let inner = analysis.inner();
        assert_abs_diff_eq!(inner.means[0], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(inner.means[1], 20.0, epsilon = 1e-6);
        assert_abs_diff_eq!(inner.means[2], 40.0, epsilon = 1e-6);
    }

    #[test]
    fn test_correct_saturation_true_near_target() {
        // An image where the active circle is entirely below threshold
        // (saturation_fraction 0.0) is not within 0.005 of the 0.01 target.
        let frame = mono_frame(40, 40, 10);
        let analysis = Analysis::new(&frame);
        assert!(!analysis.correct_saturation());
    }

    #[test]
    fn test_concentric_saturation_fractions_nonempty_for_large_frame() {
        let frame = mono_frame(200, 200, 255);
        let analysis = Analysis::new(&frame);
        assert!(!analysis.concentric_saturation_fractions().is_empty());
    }

    #[test]
    fn test_info_includes_demosaic_method_and_is_idempotent() {
        let frame = bayer_frame(200, 200, 10, 20, 40);
        let analysis = Analysis::new(&frame);
        let info1 = analysis.info();
        let info2 = analysis.info();
        assert_eq!(info1, info2);
        assert_eq!(info1[0], ("demosaic_method".to_string(), "average_greens".to_string()));
    }
}
