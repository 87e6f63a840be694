// ransac.rs — Two-point RANSAC for temporal outlier rejection.
//
// With the frame-to-frame rotation known from gyro integration, the
// remaining epipolar constraint is linear in the translation direction:
//
//   r_i(t) = (y1 − y2)·tx + (x2 − x1)·ty + (x1·y2 − y1·x2)·tz
//
// so two correspondences determine t up to scale. The small sample keeps
// the iteration count low: N = ⌈log(1 − p) / log(1 − 0.7²)⌉ (7 for
// p = 0.99).
//
// Stages: undistort both point sets, rotate the previous set by R_{p→c}
// (compensating the known rotation), jointly rescale for conditioning,
// pre-filter gross outliers, detect near-pure-rotation and fall back to a
// distance filter, then sample/solve/refit. The 2×2 solve fixes the model
// component whose restricted column has the smallest L1 norm to 1 — the
// pivot choice affects which inlier sets are found on degenerate
// geometry, so it is part of the contract.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::camera::CameraCalibration;
use crate::{FrontendError, Point2};

/// Distance cap for the pre-filter, in normalized pixel units. Generous
/// for normal motion; raise it for aggressive platforms.
const MAX_RAW_DISTANCE: f64 = 50.0;

/// Minimum fraction of all pairs a hypothesis must explain.
const MIN_INLIER_FRACTION: f64 = 0.2;

/// Reject temporal outliers between `pts1` (previous frame) and `pts2`
/// (current frame) of a single camera.
///
/// `r_p_c` is the gyro-integrated rotation taking previous-frame bearings
/// into the current frame. Returns one marker byte per input pair
/// (1 = inlier). An empty input yields an empty marker vector; mismatched
/// input lengths are a caller bug and fail the frame.
pub fn two_point_ransac(
    pts1: &[Point2],
    pts2: &[Point2],
    r_p_c: &Matrix3<f64>,
    cal: &CameraCalibration,
    inlier_error: f64,
    success_probability: f64,
    rng: &mut ChaCha8Rng,
) -> Result<Vec<u8>, FrontendError> {
    if pts1.len() != pts2.len() {
        return Err(FrontendError::PointSetMismatch(pts1.len(), pts2.len()));
    }
    if pts1.is_empty() {
        return Ok(Vec::new());
    }

    let n = pts1.len();
    let mut norm_pixel_unit = 2.0 / (cal.intrinsics.fx + cal.intrinsics.fy);
    let iter_num = ((1.0 - success_probability).ln() / (1.0 - 0.7_f64 * 0.7).ln()).ceil() as usize;

    let mut markers = vec![1u8; n];

    // Undistort, then compensate the known rotation on the previous set.
    let mut pts1_u = cal.undistort(pts1);
    let mut pts2_u = cal.undistort(pts2);
    for p in &mut pts1_u {
        let h = r_p_c * Vector3::new(p.x, p.y, 1.0);
        *p = Point2::new(h.x, h.y);
    }

    // Joint rescale so the average point norm is √2; the inlier threshold
    // scales with the points.
    let scale = rescale_points(&mut pts1_u, &mut pts2_u);
    norm_pixel_unit *= scale;

    let diffs: Vec<Vector2<f64>> = pts1_u
        .iter()
        .zip(pts2_u.iter())
        .map(|(a, b)| Vector2::new(a.x - b.x, a.y - b.y))
        .collect();

    // Pre-filter pairs with implausibly large motion and compute the mean
    // distance of the remainder.
    let mut mean_distance = 0.0;
    let mut raw_inlier_count = 0usize;
    for (i, d) in diffs.iter().enumerate() {
        let distance = d.norm();
        if distance > MAX_RAW_DISTANCE * norm_pixel_unit {
            markers[i] = 0;
        } else {
            mean_distance += distance;
            raw_inlier_count += 1;
        }
    }

    // Too few survivors happens under fast rotation with sparse tracks;
    // nothing can be estimated.
    if raw_inlier_count < 3 {
        markers.fill(0);
        return Ok(markers);
    }
    mean_distance /= raw_inlier_count as f64;

    // Near-zero translation: the translation model is unconstrained, so
    // fall back to a plain distance gate.
    if mean_distance < norm_pixel_unit {
        for (i, d) in diffs.iter().enumerate() {
            if markers[i] == 0 {
                continue;
            }
            if d.norm() > inlier_error * norm_pixel_unit {
                markers[i] = 0;
            }
        }
        return Ok(markers);
    }

    // Constraint rows, one per pair; the columns correspond to tx, ty, tz.
    let coeff: Vec<Vector3<f64>> = diffs
        .iter()
        .zip(pts1_u.iter().zip(pts2_u.iter()))
        .map(|(d, (p1, p2))| Vector3::new(d.y, -d.x, p1.x * p2.y - p1.y * p2.x))
        .collect();

    let raw_inlier_idx: Vec<usize> = (0..n).filter(|&i| markers[i] != 0).collect();
    let m = raw_inlier_idx.len();

    let threshold = inlier_error * norm_pixel_unit;
    let mut best_inlier_set: Vec<usize> = Vec::new();
    let mut best_residual = f64::MAX;

    for _ in 0..iter_num {
        // Two distinct survivors: the second index is offset from the
        // first by a nonzero amount modulo the survivor count.
        let first = rng.gen_range(0..m);
        let delta = rng.gen_range(1..m);
        let i1 = raw_inlier_idx[first];
        let i2 = raw_inlier_idx[(first + delta) % m];

        let model = match solve_two_point(&coeff[i1], &coeff[i2]) {
            Some(model) => model,
            None => continue,
        };

        let inlier_set: Vec<usize> = (0..n)
            .filter(|&i| markers[i] != 0 && coeff[i].dot(&model.t).abs() < threshold)
            .collect();

        if (inlier_set.len() as f64) < MIN_INLIER_FRACTION * n as f64 {
            continue;
        }

        // Refit on the hypothesis inliers; a singular refit skips the
        // iteration. The refit residual diagnoses model quality but the
        // winner is still chosen by support size.
        let refined = match refit_least_squares(&coeff, &inlier_set, model.pivot) {
            Some(refined) => refined,
            None => continue,
        };
        let residual = inlier_set
            .iter()
            .map(|&i| coeff[i].dot(&refined).abs())
            .sum::<f64>()
            / inlier_set.len() as f64;

        if inlier_set.len() > best_inlier_set.len() {
            best_inlier_set = inlier_set;
            best_residual = residual;
        }
    }

    debug!(
        "two-point ransac: {}/{} inliers, mean refit residual {:.3e}",
        best_inlier_set.len(),
        n,
        if best_residual == f64::MAX { 0.0 } else { best_residual },
    );

    markers.fill(0);
    for &i in &best_inlier_set {
        markers[i] = 1;
    }
    Ok(markers)
}

/// Jointly rescale both point sets so the mean norm is √2; returns the
/// applied factor.
fn rescale_points(pts1: &mut [Point2], pts2: &mut [Point2]) -> f64 {
    let mut norm_sum = 0.0;
    for p in pts1.iter().chain(pts2.iter()) {
        norm_sum += (p.x * p.x + p.y * p.y).sqrt();
    }
    if norm_sum < 1e-12 {
        return 1.0;
    }
    let scale = (pts1.len() + pts2.len()) as f64 / norm_sum * std::f64::consts::SQRT_2;
    for p in pts1.iter_mut().chain(pts2.iter_mut()) {
        p.x *= scale;
        p.y *= scale;
    }
    scale
}

/// A translation hypothesis plus the pivot axis that was pinned to 1.
struct TwoPointModel {
    t: Vector3<f64>,
    pivot: usize,
}

/// Solve the 2×2 system from two constraint rows. The component of `t`
/// whose restricted column has the smallest L1 norm is pinned to 1 and
/// the other two are solved for; ties take the lowest axis index.
fn solve_two_point(c1: &Vector3<f64>, c2: &Vector3<f64>) -> Option<TwoPointModel> {
    let cols = [
        Vector2::new(c1.x, c2.x),
        Vector2::new(c1.y, c2.y),
        Vector2::new(c1.z, c2.z),
    ];
    let norms = [cols[0].lp_norm(1), cols[1].lp_norm(1), cols[2].lp_norm(1)];
    let pivot = if norms[0] <= norms[1] && norms[0] <= norms[2] {
        0
    } else if norms[1] <= norms[2] {
        1
    } else {
        2
    };

    let (a, b) = other_axes(pivot);
    let mat = Matrix2::from_columns(&[cols[a], cols[b]]);
    let solution = mat.try_inverse()? * (-cols[pivot]);

    let mut t = Vector3::zeros();
    t[pivot] = 1.0;
    t[a] = solution.x;
    t[b] = solution.y;
    Some(TwoPointModel { t, pivot })
}

/// Least-squares refit over the selected rows using the same pivot:
/// solve (AᵀA)⁻¹ Aᵀ(−pivot column) via the 2×2 normal equations.
fn refit_least_squares(
    coeff: &[Vector3<f64>],
    rows: &[usize],
    pivot: usize,
) -> Option<Vector3<f64>> {
    let (a_axis, b_axis) = other_axes(pivot);

    let mut ata = Matrix2::zeros();
    let mut atb = Vector2::zeros();
    for &i in rows {
        let a = coeff[i][a_axis];
        let b = coeff[i][b_axis];
        let rhs = -coeff[i][pivot];
        ata[(0, 0)] += a * a;
        ata[(0, 1)] += a * b;
        ata[(1, 1)] += b * b;
        atb.x += a * rhs;
        atb.y += b * rhs;
    }
    ata[(1, 0)] = ata[(0, 1)];

    let solution = ata.try_inverse()? * atb;

    let mut t = Vector3::zeros();
    t[pivot] = 1.0;
    t[a_axis] = solution.x;
    t[b_axis] = solution.y;
    Some(t)
}

#[inline]
fn other_axes(pivot: usize) -> (usize, usize) {
    match pivot {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    }
}
