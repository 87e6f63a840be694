// klt.rs — Pyramidal Lucas-Kanade optical flow with initial-flow seeding.
//
// Forward-additive formulation: per iteration, the template patch from
// the source image is compared against the warped patch in the target
// image; gradients are evaluated at the warped position, so the 2×2
// Gauss-Newton Hessian is recomputed every iteration. Robust to the
// multi-pixel displacements this pipeline sees between frames.
//
// Both uses of the tracker seed the solve with a prior instead of zero
// flow: temporal tracking seeds with IMU-predicted positions, stereo
// matching seeds with extrinsics-projected positions. The prior enters at
// the coarsest level as an initial displacement and is refined down the
// pyramid (the initial-flow discipline of classical pyramidal LK).

use crate::image::{interpolate_bilinear, Image};
use crate::pyramid::Pyramid;
use crate::Point2;

/// Pyramidal KLT tracker configuration.
pub struct PyrLkTracker {
    /// Full edge length of the square tracking window, e.g. 31 → 31×31.
    pub patch_size: usize,
    /// Maximum Gauss-Newton iterations per pyramid level.
    pub max_iterations: usize,
    /// Convergence threshold in pixels: iteration stops when the update
    /// step is shorter than this.
    pub track_precision: f32,
    /// Number of pyramid levels above level 0; the sweep uses
    /// `pyramid_levels + 1` images coarse-to-fine.
    pub pyramid_levels: usize,
}

impl PyrLkTracker {
    pub fn new(
        patch_size: usize,
        max_iterations: usize,
        track_precision: f32,
        pyramid_levels: usize,
    ) -> Self {
        assert!(patch_size >= 3, "patch_size must be at least 3 (got {patch_size})");
        PyrLkTracker {
            patch_size,
            max_iterations,
            track_precision,
            pyramid_levels,
        }
    }

    /// Track `prev_pts` from `prev_pyr` into `curr_pyr`, seeding each
    /// solve with the corresponding entry of `initial`.
    ///
    /// Returns the tracked positions and a status byte per input point
    /// (1 = tracked, 0 = lost). Lost points keep their last iterate as a
    /// position; callers discard them via the status mask. Points outside
    /// the image are not rejected here — the pipeline applies its own
    /// bounds test after each tracking pass.
    ///
    /// # Panics
    /// Panics if `initial.len() != prev_pts.len()`.
    pub fn track(
        &self,
        prev_pyr: &Pyramid,
        curr_pyr: &Pyramid,
        prev_pts: &[Point2],
        initial: &[Point2],
    ) -> (Vec<Point2>, Vec<u8>) {
        assert_eq!(
            prev_pts.len(),
            initial.len(),
            "initial guess count ({}) must match point count ({})",
            initial.len(),
            prev_pts.len(),
        );

        let num_levels = (self.pyramid_levels + 1)
            .min(prev_pyr.num_levels())
            .min(curr_pyr.num_levels());

        let mut out_pts = Vec::with_capacity(prev_pts.len());
        let mut status = Vec::with_capacity(prev_pts.len());
        for (p, guess) in prev_pts.iter().zip(initial.iter()) {
            let (q, ok) = self.track_single(prev_pyr, curr_pyr, p, guess, num_levels);
            out_pts.push(q);
            status.push(ok as u8);
        }
        (out_pts, status)
    }

    /// Track a single point through the pyramid, coarse-to-fine.
    fn track_single(
        &self,
        prev_pyr: &Pyramid,
        curr_pyr: &Pyramid,
        pt: &Point2,
        guess: &Point2,
        num_levels: usize,
    ) -> (Point2, bool) {
        // Displacement at full resolution, from the caller's prior.
        let mut dx = (guess.x - pt.x) as f32;
        let mut dy = (guess.y - pt.y) as f32;

        // Scale the prior down to the coarsest level.
        let coarse_scale = (1u32 << (num_levels - 1)) as f32;
        dx /= coarse_scale;
        dy /= coarse_scale;

        for level in (0..num_levels).rev() {
            let prev_img = &prev_pyr.levels[level];
            let curr_img = &curr_pyr.levels[level];

            let scale = 1.0 / (1u32 << level) as f32;
            let px = pt.x as f32 * scale;
            let py = pt.y as f32 * scale;

            // Bilinear interpolation clamps at the borders, so no explicit
            // window check is needed; a patch that falls mostly outside the
            // image degenerates to a singular Hessian and reports lost.
            match self.iterate_level(prev_img, curr_img, px, py, dx, dy) {
                Some((new_dx, new_dy)) => {
                    dx = new_dx;
                    dy = new_dy;
                }
                None => {
                    // Report the last iterate at full resolution; the
                    // caller only ever discards it.
                    let level_scale = (1u32 << level) as f32;
                    let fallback = Point2::new(
                        pt.x + (dx * level_scale) as f64,
                        pt.y + (dy * level_scale) as f64,
                    );
                    return (fallback, false);
                }
            }

            // Propagate displacement to the next finer level.
            if level > 0 {
                dx *= 2.0;
                dy *= 2.0;
            }
        }

        (Point2::new(pt.x + dx as f64, pt.y + dy as f64), true)
    }

    /// Iterative forward-additive LK at one pyramid level. Returns the
    /// refined displacement, or None on a singular Hessian.
    fn iterate_level(
        &self,
        prev_img: &Image<f32>,
        curr_img: &Image<f32>,
        px: f32,
        py: f32,
        mut dx: f32,
        mut dy: f32,
    ) -> Option<(f32, f32)> {
        let half = (self.patch_size / 2) as isize;
        let eps2 = self.track_precision * self.track_precision;

        for _ in 0..self.max_iterations {
            // 2×2 Hessian and 2×1 right-hand side accumulators.
            let mut h00 = 0.0f32;
            let mut h01 = 0.0f32;
            let mut h11 = 0.0f32;
            let mut b0 = 0.0f32;
            let mut b1 = 0.0f32;

            for wy in -half..=half {
                for wx in -half..=half {
                    let wx_f = wx as f32;
                    let wy_f = wy as f32;

                    // Template pixel at the source position.
                    let t_val = interpolate_bilinear(prev_img, px + wx_f, py + wy_f);

                    // Warped pixel at source + displacement.
                    let cx = px + dx + wx_f;
                    let cy = py + dy + wy_f;
                    let i_val = interpolate_bilinear(curr_img, cx, cy);

                    let e = t_val - i_val;

                    // Gradients at the warped position, central differences.
                    let gx = 0.5
                        * (interpolate_bilinear(curr_img, cx + 1.0, cy)
                            - interpolate_bilinear(curr_img, cx - 1.0, cy));
                    let gy = 0.5
                        * (interpolate_bilinear(curr_img, cx, cy + 1.0)
                            - interpolate_bilinear(curr_img, cx, cy - 1.0));

                    h00 += gx * gx;
                    h01 += gx * gy;
                    h11 += gy * gy;
                    b0 += gx * e;
                    b1 += gy * e;
                }
            }

            let det = h00 * h11 - h01 * h01;
            if det.abs() < 1e-6 {
                return None;
            }
            let inv_det = 1.0 / det;

            let step_x = inv_det * (h11 * b0 - h01 * b1);
            let step_y = inv_det * (h00 * b1 - h01 * b0);

            dx += step_x;
            dy += step_y;

            if step_x * step_x + step_y * step_y < eps2 {
                break;
            }
        }

        Some((dx, dy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bright square on a dark background; corners give 2D gradient.
    fn make_test_image(w: usize, h: usize, sq_x: usize, sq_y: usize, sq: usize) -> Image<u8> {
        let mut img = Image::from_vec(w, h, vec![30u8; w * h]);
        for y in sq_y..(sq_y + sq).min(h) {
            for x in sq_x..(sq_x + sq).min(w) {
                img.set(x, y, 200);
            }
        }
        img
    }

    fn zero_flow(pts: &[Point2]) -> Vec<Point2> {
        pts.to_vec()
    }

    #[test]
    fn test_zero_motion() {
        let img = make_test_image(120, 120, 40, 40, 30);
        let pyr = Pyramid::build(&img, 4, 1.0);

        let tracker = PyrLkTracker::new(11, 30, 0.01, 3);
        let pts = vec![Point2::new(41.0, 41.0)];
        let (out, status) = tracker.track(&pyr, &pyr, &pts, &zero_flow(&pts));

        assert_eq!(status[0], 1);
        assert!(
            (out[0].x - 41.0).abs() < 0.5 && (out[0].y - 41.0).abs() < 0.5,
            "zero motion drifted to ({}, {})",
            out[0].x,
            out[0].y
        );
    }

    #[test]
    fn test_known_horizontal_shift() {
        let img1 = make_test_image(120, 120, 40, 40, 30);
        let img2 = make_test_image(120, 120, 43, 40, 30);

        let pyr1 = Pyramid::build(&img1, 4, 1.0);
        let pyr2 = Pyramid::build(&img2, 4, 1.0);

        let tracker = PyrLkTracker::new(15, 30, 0.01, 3);
        let pts = vec![Point2::new(41.0, 41.0)];
        let (out, status) = tracker.track(&pyr1, &pyr2, &pts, &zero_flow(&pts));

        assert_eq!(status[0], 1);
        let dx = out[0].x - 41.0;
        let dy = out[0].y - 41.0;
        assert!((dx - 3.0).abs() < 1.5, "dx = {dx}, expected ~3.0");
        assert!(dy.abs() < 1.5, "dy = {dy}, expected ~0.0");
    }

    #[test]
    fn test_initial_flow_seeds_large_shift() {
        // 12-pixel shift: too far for a cold start with a small window,
        // recoverable when the solve is seeded near the answer.
        let img1 = make_test_image(160, 120, 40, 40, 30);
        let img2 = make_test_image(160, 120, 52, 40, 30);

        let pyr1 = Pyramid::build(&img1, 4, 1.0);
        let pyr2 = Pyramid::build(&img2, 4, 1.0);

        let tracker = PyrLkTracker::new(15, 30, 0.01, 3);
        let pts = vec![Point2::new(41.0, 41.0)];
        let seeded = vec![Point2::new(52.0, 41.0)];
        let (out, status) = tracker.track(&pyr1, &pyr2, &pts, &seeded);

        assert_eq!(status[0], 1);
        let dx = out[0].x - 41.0;
        assert!((dx - 12.0).abs() < 1.5, "seeded dx = {dx}, expected ~12.0");
    }

    #[test]
    fn test_subpixel_shift() {
        // Smooth blob shifted by (1.5, 0.5); sub-pixel recovery.
        let w = 80;
        let h = 80;
        let mut data1 = vec![0u8; w * h];
        let mut data2 = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                let d1 = (x as f32 - 40.0).powi(2) + (y as f32 - 40.0).powi(2);
                data1[y * w + x] = (255.0 * (-0.005 * d1).exp()) as u8;
                let d2 = (x as f32 - 41.5).powi(2) + (y as f32 - 40.5).powi(2);
                data2[y * w + x] = (255.0 * (-0.005 * d2).exp()) as u8;
            }
        }
        let pyr1 = Pyramid::build(&Image::from_vec(w, h, data1), 4, 1.0);
        let pyr2 = Pyramid::build(&Image::from_vec(w, h, data2), 4, 1.0);

        let tracker = PyrLkTracker::new(15, 30, 0.01, 3);
        let pts = vec![Point2::new(40.0, 40.0)];
        let (out, status) = tracker.track(&pyr1, &pyr2, &pts, &zero_flow(&pts));

        assert_eq!(status[0], 1);
        let dx = out[0].x - 40.0;
        let dy = out[0].y - 40.0;
        assert!((dx - 1.5).abs() < 0.5, "dx = {dx}, expected ~1.5");
        assert!((dy - 0.5).abs() < 0.5, "dy = {dy}, expected ~0.5");
    }

    #[test]
    fn test_flat_region_lost() {
        // Zero gradient everywhere → singular Hessian → lost.
        let img = Image::from_vec(60, 60, vec![128u8; 3600]);
        let pyr = Pyramid::build(&img, 4, 1.0);

        let tracker = PyrLkTracker::new(11, 30, 0.01, 3);
        let pts = vec![Point2::new(30.0, 30.0)];
        let (_, status) = tracker.track(&pyr, &pyr, &pts, &zero_flow(&pts));
        assert_eq!(status[0], 0, "flat region should be lost");
    }

    #[test]
    fn test_multiple_points_statuses_align() {
        let img1 = make_test_image(120, 120, 40, 40, 30);
        let img2 = make_test_image(120, 120, 42, 40, 30);
        let pyr1 = Pyramid::build(&img1, 4, 1.0);
        let pyr2 = Pyramid::build(&img2, 4, 1.0);

        let tracker = PyrLkTracker::new(11, 30, 0.01, 3);
        // One corner point, one flat-background point.
        let pts = vec![Point2::new(41.0, 41.0), Point2::new(100.0, 100.0)];
        let (out, status) = tracker.track(&pyr1, &pyr2, &pts, &zero_flow(&pts));

        assert_eq!(out.len(), 2);
        assert_eq!(status.len(), 2);
        assert_eq!(status[0], 1, "textured point should track");
        assert_eq!(status[1], 0, "flat point should be lost");
    }

    #[test]
    #[should_panic(expected = "initial guess count")]
    fn test_mismatched_initial_panics() {
        let img = make_test_image(60, 60, 20, 20, 10);
        let pyr = Pyramid::build(&img, 3, 1.0);
        let tracker = PyrLkTracker::new(11, 30, 0.01, 2);
        let pts = vec![Point2::new(25.0, 25.0)];
        tracker.track(&pyr, &pyr, &pts, &[]);
    }
}
