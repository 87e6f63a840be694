// fast.rs — FAST corner detector (Features from Accelerated Segment Test).
//
// Reference: Rosten & Drummond, "Machine learning for high-speed corner
// detection" (ECCV 2006).
//
// For each pixel, sample 16 points on a Bresenham circle of radius 3 and
// classify each as BRIGHTER, DARKER, or SIMILAR relative to the center ±
// threshold. A corner exists if ≥ N contiguous circle pixels are all
// BRIGHTER or all DARKER. The contiguity check wraps around the circle
// (index 15 is adjacent to index 0); the standard trick is to duplicate
// the 16-element classification array into 32 elements and scan for a
// run of length N.
//
// Detection supports an optional mask so the replenishment stage can
// suppress re-detection in the neighborhood of features it is already
// tracking.

use crate::image::Image;
use crate::Point2;

/// Bresenham circle of radius 3: 16 (dx, dy) offsets.
/// Listed clockwise starting from 12 o'clock, matching Rosten's convention.
const CIRCLE_OFFSETS: [(isize, isize); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// A detected corner with its response score.
///
/// Coordinates are integer pixel centers cast to f64; sub-pixel accuracy
/// comes later from KLT refinement, not from the detector.
#[derive(Debug, Clone)]
pub struct Keypoint {
    /// Pixel position in the detection image.
    pub pt: Point2,
    /// Corner response: sum of (|circle[i] − center| − threshold) over the
    /// best qualifying arc. Higher = stronger corner.
    pub response: f32,
}

/// FAST-N corner detector.
pub struct FastDetector {
    /// Intensity difference threshold. A circle pixel counts as
    /// BRIGHTER/DARKER only if it differs from the center by more than
    /// this value. Typical: 10–40 for 8-bit images.
    pub threshold: u8,
    /// Minimum number of contiguous qualifying circle pixels, in [9, 12].
    pub arc_length: usize,
}

impl FastDetector {
    /// Create a new FAST detector.
    ///
    /// # Panics
    /// Panics if `arc_length` is not in the range [9, 12].
    pub fn new(threshold: u8, arc_length: usize) -> Self {
        assert!(
            (9..=12).contains(&arc_length),
            "arc_length must be 9..=12 (got {arc_length})"
        );
        FastDetector {
            threshold,
            arc_length,
        }
    }

    /// Detect FAST corners in an 8-bit grayscale image.
    pub fn detect(&self, image: &Image<u8>) -> Vec<Keypoint> {
        self.detect_masked(image, None)
    }

    /// Detect FAST corners, skipping pixels where `mask` is zero.
    ///
    /// The mask, when present, must match the image dimensions.
    pub fn detect_masked(&self, image: &Image<u8>, mask: Option<&Image<u8>>) -> Vec<Keypoint> {
        let w = image.width();
        let h = image.height();
        let mut keypoints = Vec::new();

        // The Bresenham circle has radius 3; skip a 3-pixel border.
        if w <= 6 || h <= 6 {
            return keypoints;
        }
        if let Some(m) = mask {
            assert!(
                m.width() == w && m.height() == h,
                "mask dimensions {}×{} do not match image {}×{}",
                m.width(),
                m.height(),
                w,
                h,
            );
        }

        let thresh = self.threshold as i16;
        let min_cardinals: u8 = if self.arc_length >= 12 { 3 } else { 2 };

        for y in 3..(h - 3) {
            for x in 3..(w - 3) {
                if let Some(m) = mask {
                    // SAFETY: (x, y) is interior; mask dims equal image dims.
                    if unsafe { m.get_unchecked(x, y) } == 0 {
                        continue;
                    }
                }

                // SAFETY: x in [3, w-3) and y in [3, h-3), and all circle
                // offsets are at most ±3, so every access is in bounds.
                unsafe {
                    let center = image.get_unchecked(x, y) as i16;

                    // Quick rejection (Rosten's high-speed test): check the
                    // 4 cardinal circle points first.
                    let p0 = image.get_unchecked(
                        (x as isize + CIRCLE_OFFSETS[0].0) as usize,
                        (y as isize + CIRCLE_OFFSETS[0].1) as usize,
                    ) as i16;
                    let p4 = image.get_unchecked(
                        (x as isize + CIRCLE_OFFSETS[4].0) as usize,
                        (y as isize + CIRCLE_OFFSETS[4].1) as usize,
                    ) as i16;
                    let p8 = image.get_unchecked(
                        (x as isize + CIRCLE_OFFSETS[8].0) as usize,
                        (y as isize + CIRCLE_OFFSETS[8].1) as usize,
                    ) as i16;
                    let p12 = image.get_unchecked(
                        (x as isize + CIRCLE_OFFSETS[12].0) as usize,
                        (y as isize + CIRCLE_OFFSETS[12].1) as usize,
                    ) as i16;

                    let bright_count = (p0 > center + thresh) as u8
                        + (p4 > center + thresh) as u8
                        + (p8 > center + thresh) as u8
                        + (p12 > center + thresh) as u8;
                    let dark_count = (p0 < center - thresh) as u8
                        + (p4 < center - thresh) as u8
                        + (p8 < center - thresh) as u8
                        + (p12 < center - thresh) as u8;

                    if bright_count < min_cardinals && dark_count < min_cardinals {
                        continue;
                    }

                    // Full 16-point test.
                    let mut circle_vals = [0i16; 16];
                    for (i, &(dx, dy)) in CIRCLE_OFFSETS.iter().enumerate() {
                        circle_vals[i] = image
                            .get_unchecked((x as isize + dx) as usize, (y as isize + dy) as usize)
                            as i16;
                    }

                    let (is_corner, response) =
                        self.check_contiguous_and_score(center, &circle_vals, thresh);

                    if is_corner {
                        keypoints.push(Keypoint {
                            pt: Point2::new(x as f64, y as f64),
                            response,
                        });
                    }
                }
            }
        }

        keypoints
    }

    /// Check whether N contiguous circle pixels are all brighter or all
    /// darker than center ± threshold, and compute the corner score.
    ///
    /// Returns (is_corner, score). Score = sum of (|diff| − threshold)
    /// over the best qualifying arc.
    fn check_contiguous_and_score(
        &self,
        center: i16,
        circle: &[i16; 16],
        thresh: i16,
    ) -> (bool, f32) {
        let n = self.arc_length;

        // Classify each circle pixel: +1 brighter, -1 darker, 0 similar.
        let mut class = [0i8; 16];
        for i in 0..16 {
            let diff = circle[i] - center;
            if diff > thresh {
                class[i] = 1;
            } else if diff < -thresh {
                class[i] = -1;
            }
        }

        // Doubled array for wrap-around scanning.
        let mut doubled = [0i8; 32];
        doubled[..16].copy_from_slice(&class);
        doubled[16..].copy_from_slice(&class);

        let mut best_score = -1.0f32;

        for polarity in [1i8, -1i8] {
            let mut run_start = 0;
            while run_start < 16 {
                if doubled[run_start] != polarity {
                    run_start += 1;
                    continue;
                }
                let mut run_end = run_start;
                while run_end < 32 && doubled[run_end] == polarity {
                    run_end += 1;
                }
                let run_len = run_end - run_start;
                if run_len >= n {
                    let score = arc_score(center, circle, thresh, run_start, run_len);
                    if score > best_score {
                        best_score = score;
                    }
                }
                run_start = run_end;
            }
        }

        (best_score >= 0.0, best_score.max(0.0))
    }
}

/// Score for an arc starting at `start` with length `len` in the doubled
/// array; indices map back to [0, 16) to read circle values.
fn arc_score(center: i16, circle: &[i16; 16], thresh: i16, start: usize, len: usize) -> f32 {
    let mut score = 0.0f32;
    for i in start..start + len {
        let idx = i % 16;
        let diff = (circle[idx] - center).abs() - thresh;
        score += diff.max(0) as f32;
    }
    score
}
