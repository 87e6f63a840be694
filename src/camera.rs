// camera.rs — Pinhole camera model with radtan / equidistant distortion.
//
// Two operations, inverse of each other:
//   undistort: pixel → normalized camera coordinates (z = 1 bearing),
//              optionally rotated by a rectification matrix and
//              re-projected through a new intrinsic matrix;
//   distort:   normalized coordinates → pixel, through the distortion
//              model and the intrinsic matrix.
//
// radtan (plumb-bob) inversion uses fixed-point iteration on the
// distortion equations; equidistant (fisheye, kb4) inversion uses Newton
// iteration on the distorted angle polynomial.

use nalgebra::{Matrix3, Vector3};
use std::sync::Once;
use tracing::warn;

use crate::Point2;

/// Lens distortion model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistortionModel {
    /// Radial-tangential (plumb-bob): coeffs = [k1, k2, p1, p2].
    Radtan,
    /// Equidistant fisheye (kb4): coeffs = [k1, k2, k3, k4].
    Equidistant,
}

static UNKNOWN_MODEL_WARNING: Once = Once::new();

impl DistortionModel {
    /// Parse a model name. Unknown names fall back to radtan with a
    /// one-shot warning.
    pub fn from_name(name: &str) -> Self {
        match name {
            "radtan" => DistortionModel::Radtan,
            "equidistant" => DistortionModel::Equidistant,
            other => {
                let owned = other.to_owned();
                UNKNOWN_MODEL_WARNING.call_once(|| {
                    warn!("distortion model `{owned}` is unrecognized, using radtan instead");
                });
                DistortionModel::Radtan
            }
        }
    }
}

/// Pinhole intrinsics (fx, fy, cx, cy), all in pixels.
#[derive(Debug, Clone, Copy)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        CameraIntrinsics { fx, fy, cx, cy }
    }

    /// Pixel → normalized camera coordinates (applies K⁻¹).
    #[inline]
    pub fn normalize(&self, p: &Point2) -> Point2 {
        Point2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }

    /// Normalized camera coordinates → pixel (applies K).
    #[inline]
    pub fn denormalize(&self, p: &Point2) -> Point2 {
        Point2::new(p.x * self.fx + self.cx, p.y * self.fy + self.cy)
    }

    /// The 3×3 intrinsic matrix K.
    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }
}

/// Full per-camera calibration: intrinsics, distortion, and the IMU
/// extrinsics `(R_cam_imu, t_cam_imu)` such that a vector in the IMU
/// frame maps to the camera frame as `v_cam = R_cam_imu^T · v_imu`.
#[derive(Debug, Clone)]
pub struct CameraCalibration {
    /// Image width and height in pixels, used for sanity checks and
    /// bounds rejection.
    pub resolution: [u32; 2],
    pub intrinsics: CameraIntrinsics,
    pub distortion_model: DistortionModel,
    pub distortion_coeffs: [f64; 4],
    pub r_cam_imu: Matrix3<f64>,
    pub t_cam_imu: Vector3<f64>,
}

impl CameraCalibration {
    /// Undistort pixels to normalized camera coordinates (R_rect = I).
    pub fn undistort(&self, pts: &[Point2]) -> Vec<Point2> {
        undistort_points(
            pts,
            &self.intrinsics,
            self.distortion_model,
            &self.distortion_coeffs,
            &Matrix3::identity(),
            None,
        )
    }

    /// Undistort pixels to normalized coordinates rotated by `r_rect`.
    pub fn undistort_rotated(&self, pts: &[Point2], r_rect: &Matrix3<f64>) -> Vec<Point2> {
        undistort_points(
            pts,
            &self.intrinsics,
            self.distortion_model,
            &self.distortion_coeffs,
            r_rect,
            None,
        )
    }

    /// Project normalized coordinates back to distorted pixels.
    pub fn distort(&self, pts: &[Point2]) -> Vec<Point2> {
        distort_points(
            pts,
            &self.intrinsics,
            self.distortion_model,
            &self.distortion_coeffs,
        )
    }

    /// True iff the pixel lies inside the image bounds.
    #[inline]
    pub fn contains(&self, p: &Point2) -> bool {
        p.x >= 0.0
            && p.x <= (self.resolution[0] - 1) as f64
            && p.y >= 0.0
            && p.y <= (self.resolution[1] - 1) as f64
    }
}

/// Undistort pixel points.
///
/// Each pixel is back-projected to normalized coordinates, the distortion
/// is inverted iteratively, the bearing is rotated by `r_rect`, and the
/// result is either left on the z = 1 plane (`k_new = None`, the
/// pipeline's canonical representation) or re-projected through `k_new`.
pub fn undistort_points(
    pts: &[Point2],
    intrinsics: &CameraIntrinsics,
    model: DistortionModel,
    coeffs: &[f64; 4],
    r_rect: &Matrix3<f64>,
    k_new: Option<&CameraIntrinsics>,
) -> Vec<Point2> {
    let mut out = Vec::with_capacity(pts.len());
    for p in pts {
        let nd = intrinsics.normalize(p);
        let n = match model {
            DistortionModel::Radtan => invert_radtan(&nd, coeffs),
            DistortionModel::Equidistant => invert_equidistant(&nd, coeffs),
        };

        let v = r_rect * Vector3::new(n.x, n.y, 1.0);
        let rectified = Point2::new(v.x / v.z, v.y / v.z);

        out.push(match k_new {
            Some(k) => k.denormalize(&rectified),
            None => rectified,
        });
    }
    out
}

/// Distort normalized (z = 1) points and project them through K.
pub fn distort_points(
    pts: &[Point2],
    intrinsics: &CameraIntrinsics,
    model: DistortionModel,
    coeffs: &[f64; 4],
) -> Vec<Point2> {
    pts.iter()
        .map(|p| {
            let d = match model {
                DistortionModel::Radtan => apply_radtan(p, coeffs),
                DistortionModel::Equidistant => apply_equidistant(p, coeffs),
            };
            intrinsics.denormalize(&d)
        })
        .collect()
}

/// Forward radtan distortion on normalized coordinates.
fn apply_radtan(p: &Point2, c: &[f64; 4]) -> Point2 {
    let [k1, k2, p1, p2] = *c;
    let (x, y) = (p.x, p.y);
    let r2 = x * x + y * y;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
    Point2::new(
        x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
        y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
    )
}

/// Invert radtan by fixed-point iteration: solve
///   x_d = x·radial(x, y) + tangential(x, y)
/// for (x, y) given the distorted (x_d, y_d). Converges in well under
/// 20 iterations for real lens coefficients.
fn invert_radtan(distorted: &Point2, c: &[f64; 4]) -> Point2 {
    let [k1, k2, p1, p2] = *c;
    let (x0, y0) = (distorted.x, distorted.y);
    let mut x = x0;
    let mut y = y0;

    for _ in 0..20 {
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        x = (x0 - dx) / radial;
        y = (y0 - dy) / radial;
    }
    Point2::new(x, y)
}

/// The kb4 angle polynomial θ_d = θ(1 + k1θ² + k2θ⁴ + k3θ⁶ + k4θ⁸).
fn kb4_theta_d(theta: f64, c: &[f64; 4]) -> f64 {
    let t2 = theta * theta;
    let t4 = t2 * t2;
    let t6 = t2 * t4;
    let t8 = t4 * t4;
    theta * (1.0 + c[0] * t2 + c[1] * t4 + c[2] * t6 + c[3] * t8)
}

fn kb4_dtheta_d(theta: f64, c: &[f64; 4]) -> f64 {
    let t2 = theta * theta;
    let t4 = t2 * t2;
    let t6 = t2 * t4;
    let t8 = t4 * t4;
    1.0 + 3.0 * c[0] * t2 + 5.0 * c[1] * t4 + 7.0 * c[2] * t6 + 9.0 * c[3] * t8
}

/// Forward equidistant distortion on normalized coordinates.
fn apply_equidistant(p: &Point2, c: &[f64; 4]) -> Point2 {
    let r = (p.x * p.x + p.y * p.y).sqrt();
    if r < 1e-8 {
        return *p;
    }
    let theta = r.atan();
    let scale = kb4_theta_d(theta, c) / r;
    Point2::new(p.x * scale, p.y * scale)
}

/// Invert equidistant distortion: Newton-solve θ from θ_d, then rescale
/// back onto the z = 1 plane with tan(θ).
fn invert_equidistant(distorted: &Point2, c: &[f64; 4]) -> Point2 {
    let theta_d = (distorted.x * distorted.x + distorted.y * distorted.y).sqrt();
    if theta_d < 1e-8 {
        return *distorted;
    }

    let mut theta = theta_d;
    for _ in 0..5 {
        let next = theta - (kb4_theta_d(theta, c) - theta_d) / kb4_dtheta_d(theta, c);
        if (next - theta).abs() < 1e-10 {
            theta = next;
            break;
        }
        theta = next;
    }

    let scale = theta.tan() / theta_d;
    Point2::new(distorted.x * scale, distorted.y * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(458.654, 457.296, 367.215, 248.375)
    }

    #[test]
    fn test_normalize_denormalize() {
        let k = intrinsics();
        let pp = Point2::new(367.215, 248.375);
        let n = k.normalize(&pp);
        assert!(n.x.abs() < 1e-12 && n.y.abs() < 1e-12);

        let p = Point2::new(123.456, 321.654);
        let back = k.denormalize(&k.normalize(&p));
        assert!((back.x - p.x).abs() < 1e-9);
        assert!((back.y - p.y).abs() < 1e-9);
    }

    #[test]
    fn test_radtan_roundtrip_grid() {
        // distort(undistort(p)) ≈ p within 1e-3 px across the frame.
        let k = intrinsics();
        let coeffs = [-0.28, 0.07, 0.0, 0.0];

        let mut pixels = Vec::new();
        for y in (40..440).step_by(80) {
            for x in (40..700).step_by(110) {
                pixels.push(Point2::new(x as f64, y as f64));
            }
        }

        let normalized = undistort_points(
            &pixels,
            &k,
            DistortionModel::Radtan,
            &coeffs,
            &Matrix3::identity(),
            None,
        );
        let back = distort_points(&normalized, &k, DistortionModel::Radtan, &coeffs);

        for (p, b) in pixels.iter().zip(back.iter()) {
            assert!(
                (p.x - b.x).abs() < 1e-3 && (p.y - b.y).abs() < 1e-3,
                "round-trip drift at ({}, {}): got ({}, {})",
                p.x,
                p.y,
                b.x,
                b.y,
            );
        }
    }

    #[test]
    fn test_equidistant_roundtrip_grid() {
        let k = intrinsics();
        let coeffs = [-0.013, 0.021, -0.013, 0.002];

        let mut pixels = Vec::new();
        for y in (60..420).step_by(90) {
            for x in (60..680).step_by(120) {
                pixels.push(Point2::new(x as f64, y as f64));
            }
        }

        let normalized = undistort_points(
            &pixels,
            &k,
            DistortionModel::Equidistant,
            &coeffs,
            &Matrix3::identity(),
            None,
        );
        let back = distort_points(&normalized, &k, DistortionModel::Equidistant, &coeffs);

        for (p, b) in pixels.iter().zip(back.iter()) {
            assert!(
                (p.x - b.x).abs() < 1e-3 && (p.y - b.y).abs() < 1e-3,
                "round-trip drift at ({}, {}): got ({}, {})",
                p.x,
                p.y,
                b.x,
                b.y,
            );
        }
    }

    #[test]
    fn test_zero_distortion_is_pure_projection() {
        let k = intrinsics();
        let coeffs = [0.0; 4];
        let pts = vec![Point2::new(100.0, 200.0)];
        let n = undistort_points(
            &pts,
            &k,
            DistortionModel::Radtan,
            &coeffs,
            &Matrix3::identity(),
            None,
        );
        let expected = k.normalize(&pts[0]);
        assert!((n[0].x - expected.x).abs() < 1e-12);
        assert!((n[0].y - expected.y).abs() < 1e-12);
    }

    #[test]
    fn test_undistort_with_new_intrinsics_is_pixels() {
        // K_new = K and no distortion: output equals the input pixels.
        let k = intrinsics();
        let coeffs = [0.0; 4];
        let pts = vec![Point2::new(50.0, 60.0), Point2::new(600.0, 400.0)];
        let out = undistort_points(
            &pts,
            &k,
            DistortionModel::Radtan,
            &coeffs,
            &Matrix3::identity(),
            Some(&k),
        );
        for (p, o) in pts.iter().zip(out.iter()) {
            assert!((p.x - o.x).abs() < 1e-9 && (p.y - o.y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rectification_rotation_applied() {
        // A 90° yaw about the camera z-axis maps (x, y) to (-y, x) on
        // the normalized plane.
        let k = intrinsics();
        let coeffs = [0.0; 4];
        let r = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let pts = vec![k.denormalize(&Point2::new(0.2, 0.1))];
        let out = undistort_points(&pts, &k, DistortionModel::Radtan, &coeffs, &r, None);
        assert!((out[0].x - (-0.1)).abs() < 1e-9);
        assert!((out[0].y - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_falls_back_to_radtan() {
        assert_eq!(DistortionModel::from_name("radtan"), DistortionModel::Radtan);
        assert_eq!(
            DistortionModel::from_name("equidistant"),
            DistortionModel::Equidistant
        );
        assert_eq!(
            DistortionModel::from_name("fov-model"),
            DistortionModel::Radtan
        );
    }

    #[test]
    fn test_contains_bounds() {
        let cal = CameraCalibration {
            resolution: [752, 480],
            intrinsics: intrinsics(),
            distortion_model: DistortionModel::Radtan,
            distortion_coeffs: [0.0; 4],
            r_cam_imu: Matrix3::identity(),
            t_cam_imu: Vector3::zeros(),
        };
        assert!(cal.contains(&Point2::new(0.0, 0.0)));
        assert!(cal.contains(&Point2::new(751.0, 479.0)));
        assert!(!cal.contains(&Point2::new(-0.5, 10.0)));
        assert!(!cal.contains(&Point2::new(10.0, 479.5)));
    }
}
