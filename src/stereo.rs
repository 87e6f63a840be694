// stereo.rs — Left→right stereo matching with epipolar verification.
//
// Right-image correspondences are found by KLT between the two
// current-frame pyramids, seeded by projecting each left point through
// the stereo extrinsics (undistort in cam0 → rotate into cam1 → distort
// through cam1). Matches are then screened twice: image-bounds rejection,
// and the point-to-line epipolar distance under the essential matrix
// implied by the calibrated extrinsics.
//
// The epipolar residual is the one-sided distance of the right point to
// the left point's epipolar line, in normalized coordinates; the
// `stereo_threshold` config value is calibrated against exactly this
// metric (not the symmetric Sampson form).

use nalgebra::{Matrix3, Vector3};

use crate::camera::CameraCalibration;
use crate::klt::PyrLkTracker;
use crate::pyramid::Pyramid;
use crate::Point2;

/// Match `cam0_points` into the right image.
///
/// `initial` supplies per-point starting positions for the KLT solve; an
/// empty slice means "derive the seed from the stereo extrinsics", which
/// is the normal mode. Returns the right-image points and an inlier
/// marker byte per input (1 = stereo-verified).
pub fn stereo_match(
    cam0_points: &[Point2],
    initial: &[Point2],
    cam0_pyramid: &Pyramid,
    cam1_pyramid: &Pyramid,
    cal0: &CameraCalibration,
    cal1: &CameraCalibration,
    tracker: &PyrLkTracker,
    stereo_threshold: f64,
) -> (Vec<Point2>, Vec<u8>) {
    if cam0_points.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let r_cam0_cam1 = cal1.r_cam_imu.transpose() * cal0.r_cam_imu;

    // Initial guess: project each left bearing into cam1. Depth-free, so
    // it is exact only at infinity, but it lands within the KLT basin for
    // ordinary stereo baselines.
    let guesses: Vec<Point2> = if initial.is_empty() {
        let rotated = cal0.undistort_rotated(cam0_points, &r_cam0_cam1);
        cal1.distort(&rotated)
    } else {
        assert_eq!(
            initial.len(),
            cam0_points.len(),
            "initial guess count ({}) must match point count ({})",
            initial.len(),
            cam0_points.len(),
        );
        initial.to_vec()
    };

    let (cam1_points, mut markers) = tracker.track(cam0_pyramid, cam1_pyramid, cam0_points, &guesses);

    // Tracked positions outside the right image are unusable.
    for (i, p) in cam1_points.iter().enumerate() {
        if markers[i] == 0 {
            continue;
        }
        if !cal1.contains(p) {
            markers[i] = 0;
        }
    }

    epipolar_reject(cam0_points, &cam1_points, &mut markers, cal0, cal1, stereo_threshold);

    (cam1_points, markers)
}

/// Screen matches against the extrinsic essential matrix
/// `E = [t_cam0_cam1]_× · R_cam0_cam1`, zeroing the marker of any pair
/// whose point-to-epipolar-line distance exceeds
/// `stereo_threshold · 4 / (fx0 + fy0 + fx1 + fy1)`.
pub fn epipolar_reject(
    cam0_points: &[Point2],
    cam1_points: &[Point2],
    markers: &mut [u8],
    cal0: &CameraCalibration,
    cal1: &CameraCalibration,
    stereo_threshold: f64,
) {
    let r_cam0_cam1 = cal1.r_cam_imu.transpose() * cal0.r_cam_imu;
    let t_cam0_cam1 = cal1.r_cam_imu.transpose() * (cal0.t_cam_imu - cal1.t_cam_imu);
    let essential = skew(&t_cam0_cam1) * r_cam0_cam1;

    let cam0_undistorted = cal0.undistort(cam0_points);
    let cam1_undistorted = cal1.undistort(cam1_points);

    // Average reciprocal focal length: one pixel expressed in normalized
    // units, so the threshold is resolution-independent.
    let norm_pixel_unit = 4.0
        / (cal0.intrinsics.fx + cal0.intrinsics.fy + cal1.intrinsics.fx + cal1.intrinsics.fy);

    for i in 0..cam0_undistorted.len() {
        if markers[i] == 0 {
            continue;
        }
        let p0 = Vector3::new(cam0_undistorted[i].x, cam0_undistorted[i].y, 1.0);
        let p1 = Vector3::new(cam1_undistorted[i].x, cam1_undistorted[i].y, 1.0);
        let epipolar_line = essential * p0;
        let error = p1.dot(&epipolar_line).abs()
            / (epipolar_line.x * epipolar_line.x + epipolar_line.y * epipolar_line.y).sqrt();
        if error > stereo_threshold * norm_pixel_unit {
            markers[i] = 0;
        }
    }
}

/// Cross-product matrix: `skew(v) · w = v × w`.
fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}
