// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Purely geometric mask generation over an image plane. No I/O.

use image::GrayImage;

/// A resolved set of masks for one image size: the fisheye-illuminated
/// active circle, the outer annulus beyond it, four corner discs, and a
/// sequence of concentric annuli spanning the active radius to the image
/// half-diagonal.
#[derive(Clone, Debug)]
pub struct MaskPlan {
    pub width: u32,
    pub height: u32,
    pub centre: (f64, f64),
    pub active_radius: f64,
    pub margin: f64,
    /// One mask per ring, ordered from the active radius outward.
    pub concentric_annuli: Vec<GrayImage>,
    pub active_circle: GrayImage,
    pub outer_annulus: GrayImage,
    pub corner_discs: GrayImage,
}

impl MaskPlan {
    /// Builds a MaskPlan for an image of `width x height`, with an active
    /// circle centred at `centre` with radius `active_radius`, and ring
    /// width `margin`.
    pub fn build(width: u32, height: u32, centre: (f64, f64), active_radius: f64, margin: f64) -> Self {
        let active_circle = circle_mask(width, height, centre, active_radius);
        let outer_annulus = annulus_mask(width, height, centre, active_radius + margin, f64::INFINITY);
        let corner_discs = corner_discs_mask(width, height, 2.0 * margin);

        let half_diagonal = ((width as f64).powi(2) + (height as f64).powi(2)).sqrt() / 2.0;
        let mut concentric_annuli = Vec::new();
        let mut inner = active_radius;
        while inner < half_diagonal {
            let outer = (inner + margin).min(half_diagonal);
            concentric_annuli.push(annulus_mask(width, height, centre, inner, outer));
            inner += margin;
        }

        MaskPlan {
            width,
            height,
            centre,
            active_radius,
            margin,
            concentric_annuli,
            active_circle,
            outer_annulus,
            corner_discs,
        }
    }

    /// Default active circle for the given resolution, per §4.3: full
    /// resolution (2452x2068) uses centre (1226, 1034), radius 472, margin
    /// 100; at half resolution the centre and radius are halved and the
    /// margin is 50. Generalized to scale proportionally to `width` so
    /// intermediate and test resolutions (e.g. a demosaiced half-resolution
    /// RGB view of a non-full-size sensor crop) get a sensibly-sized active
    /// circle rather than one keyed to only the two named resolutions.
    pub fn default_for_size(width: u32, height: u32) -> Self {
        const FULL_CENTRE: (f64, f64) = (1226.0, 1034.0);
        const FULL_RADIUS: f64 = 472.0;
        const FULL_MARGIN: f64 = 100.0;
        const FULL_WIDTH: f64 = 2452.0;

        let scale = width as f64 / FULL_WIDTH;
        Self::build(
            width,
            height,
            (FULL_CENTRE.0 * scale, FULL_CENTRE.1 * scale),
            FULL_RADIUS * scale,
            FULL_MARGIN * scale,
        )
    }
}

/// A filled disc (white inside radius `r` of `centre`, black outside).
pub fn circle_mask(width: u32, height: u32, centre: (f64, f64), r: f64) -> GrayImage {
    annulus_mask(width, height, centre, 0.0, r)
}

/// A ring: white where `inner <= distance(pixel, centre) < outer`, black
/// elsewhere. `outer` may be `f64::INFINITY` for an unbounded outer edge.
pub fn annulus_mask(width: u32, height: u32, centre: (f64, f64), inner: f64, outer: f64) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 + 0.5 - centre.0;
            let dy = y as f64 + 0.5 - centre.1;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist >= inner && dist < outer {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
    }
    mask
}

/// A list of paired radii producing concentric annuli, applied in
/// descending order of outer radius (each subsequent, smaller disc punches a
/// black hole in what was filled before it) so an odd nesting yields
/// alternating bands.
pub fn nested_rings_mask(width: u32, height: u32, centre: (f64, f64), mut radii: Vec<(f64, f64)>) -> GrayImage {
    radii.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    let mut mask = GrayImage::new(width, height);
    for (outer, inner) in radii {
        for y in 0..height {
            for x in 0..width {
                let dx = x as f64 + 0.5 - centre.0;
                let dy = y as f64 + 0.5 - centre.1;
                let dist = (dx * dx + dy * dy).sqrt();
                if dist < outer {
                    mask.put_pixel(x, y, image::Luma([if dist < inner { 0 } else { 255 }]));
                }
            }
        }
    }
    mask
}

/// Four discs of radius `r` centred at each image corner, clipped to the
/// image rectangle.
pub fn corner_discs_mask(width: u32, height: u32, r: f64) -> GrayImage {
    let corners = [
        (0.0, 0.0),
        (width as f64, 0.0),
        (0.0, height as f64),
        (width as f64, height as f64),
    ];
    let mut mask = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            for &(cx, cy) in &corners {
                let dx = x as f64 + 0.5 - cx;
                let dy = y as f64 + 0.5 - cy;
                if (dx * dx + dy * dy).sqrt() < r {
                    mask.put_pixel(x, y, image::Luma([255]));
                    break;
                }
            }
        }
    }
    mask
}

/// Boolean complement of a mask (invert-mask semantics used for the outer
/// annulus saturation computation: same mask data, complemented before use).
pub fn invert_mask(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = 255 - pixel.0[0];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_mask_center_is_white() {
        let mask = circle_mask(20, 20, (10.0, 10.0), 5.0);
        assert_eq!(mask.get_pixel(10, 10).0[0], 255);
    }

    #[test]
    fn test_circle_mask_corner_is_black() {
        let mask = circle_mask(20, 20, (10.0, 10.0), 5.0);
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn test_annulus_excludes_inner_disc() {
        let mask = annulus_mask(40, 40, (20.0, 20.0), 5.0, 10.0);
        // Right at the centre (distance 0) must be excluded (inner bound).
        assert_eq!(mask.get_pixel(20, 20).0[0], 0);
        // Distance ~7 from centre should be inside the ring.
        assert_eq!(mask.get_pixel(27, 20).0[0], 255);
    }

    #[test]
    fn test_corner_discs_mask_hits_all_corners() {
        let mask = corner_discs_mask(20, 20, 3.0);
        assert_eq!(mask.get_pixel(0, 0).0[0], 255);
        assert_eq!(mask.get_pixel(19, 0).0[0], 255);
        assert_eq!(mask.get_pixel(0, 19).0[0], 255);
        assert_eq!(mask.get_pixel(19, 19).0[0], 255);
        assert_eq!(mask.get_pixel(10, 10).0[0], 0);
    }

    #[test]
    fn test_invert_mask() {
        let mask = circle_mask(10, 10, (5.0, 5.0), 3.0);
        let inverted = invert_mask(&mask);
        assert_eq!(inverted.get_pixel(5, 5).0[0], 0);
        assert_eq!(inverted.get_pixel(0, 0).0[0], 255);
    }

    #[test]
    fn test_mask_plan_default_half_resolution_halves_params() {
        let full = MaskPlan::default_for_size(2452, 2068);
        let half = MaskPlan::default_for_size(1226, 1034);
        assert_abs_diff_eq(full.active_radius / 2.0, half.active_radius);
        assert_abs_diff_eq(full.margin / 2.0, half.margin);
    }

    fn assert_abs_diff_eq(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_mask_plan_concentric_annuli_span_to_half_diagonal() {
        let plan = MaskPlan::build(100, 100, (50.0, 50.0), 20.0, 10.0);
        assert!(!plan.concentric_annuli.is_empty());
    }

    #[test]
    fn test_nested_rings_mask_alternates_bands() {
        // Two nested rings, (30,20) and (10,0): punching the smaller disc
        // out of the larger leaves alternating white/black/white/black
        // bands from the centre outward.
        let centre = (50.0, 50.0);
        let mask = nested_rings_mask(100, 100, centre, vec![(30.0, 20.0), (10.0, 0.0)]);
        let at = |d: f64| mask.get_pixel((centre.0 + d) as u32, centre.1 as u32).0[0];
        assert_eq!(at(5.0), 255, "innermost disc should be white");
        assert_eq!(at(15.0), 0, "the punched gap should be black");
        assert_eq!(at(25.0), 255, "the outer ring should be white");
        assert_eq!(at(35.0), 0, "outside every ring should be black");
    }

    #[test]
    fn test_nested_rings_mask_sorts_radii_regardless_of_input_order() {
        let centre = (50.0, 50.0);
        let ascending = nested_rings_mask(100, 100, centre, vec![(10.0, 0.0), (30.0, 20.0)]);
        let descending = nested_rings_mask(100, 100, centre, vec![(30.0, 20.0), (10.0, 0.0)]);
        assert_eq!(ascending, descending);
    }
}
