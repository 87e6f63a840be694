// config.rs — Calibration and processor parameter loading.
//
// One YAML document in kalibr layout: a `cam0`/`cam1` block per camera
// (resolution, intrinsics, distortion, and the 4×4 transforms
// `cam0/T_cam_imu` (IMU→cam0) and `cam1/T_cn_cnm1` (cam0→cam1)), plus
// flat processor keys with defaults. Loaded once at startup; any missing
// or malformed calibration is fatal.
//
// The stored extrinsics are inverted into the form the pipeline uses
// throughout: `R_cam_imu` / `t_cam_imu` with
// `v_cam = R_cam_imu^T · v_imu`.

use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::camera::{CameraCalibration, CameraIntrinsics, DistortionModel};

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid calibration: {0}")]
    Invalid(String),
}

/// Image-processing parameters, all with working defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Spatial bucket grid dimensions.
    pub grid_row: usize,
    pub grid_col: usize,
    /// Replenish target per cell.
    pub grid_min_feature_num: usize,
    /// Hard per-cell cap.
    pub grid_max_feature_num: usize,
    /// KLT pyramid height (the pyramid holds `pyramid_levels + 1` images).
    pub pyramid_levels: usize,
    /// KLT window edge length in pixels.
    pub patch_size: usize,
    /// FAST corner threshold.
    pub fast_threshold: u8,
    /// Per-level KLT iteration cap.
    pub max_iteration: usize,
    /// KLT convergence epsilon in pixels.
    pub track_precision: f64,
    /// Inlier threshold for temporal two-point RANSAC, in pixels.
    pub ransac_threshold: f64,
    /// Inlier threshold for the stereo epipolar test, in pixels.
    pub stereo_threshold: f64,
    /// IMU integration window extension before the previous frame, in
    /// seconds.
    pub imu_window_lead: f64,
    /// IMU integration window extension after the current frame, in
    /// seconds.
    pub imu_window_lag: f64,
    /// Seed for the RANSAC sampler; fixed so runs are reproducible.
    pub ransac_seed: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            grid_row: 4,
            grid_col: 4,
            grid_min_feature_num: 2,
            grid_max_feature_num: 4,
            pyramid_levels: 3,
            patch_size: 31,
            fast_threshold: 20,
            max_iteration: 30,
            track_precision: 0.01,
            ransac_threshold: 3.0,
            stereo_threshold: 3.0,
            imu_window_lead: 0.010,
            imu_window_lag: 0.005,
            ransac_seed: 42,
        }
    }
}

/// Complete front-end configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub cam0: CameraCalibration,
    pub cam1: CameraCalibration,
    pub processor: ProcessorConfig,
}

#[derive(Deserialize)]
struct RawConfig {
    cam0: RawCamera,
    cam1: RawCamera,
    #[serde(flatten)]
    processor: ProcessorConfig,
}

#[derive(Deserialize)]
struct RawCamera {
    resolution: [u32; 2],
    intrinsics: [f64; 4],
    #[serde(default = "default_model_name")]
    distortion_model: String,
    distortion_coeffs: [f64; 4],
    #[serde(rename = "T_cam_imu")]
    t_cam_imu: Option<[[f64; 4]; 4]>,
    #[serde(rename = "T_cn_cnm1")]
    t_cn_cnm1: Option<[[f64; 4]; 4]>,
}

fn default_model_name() -> String {
    "radtan".to_owned()
}

impl Config {
    /// Parse a YAML configuration document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;

        // IMU→cam0 is given directly.
        let t_imu_cam0_mat = raw
            .cam0
            .t_cam_imu
            .ok_or_else(|| ConfigError::Invalid("cam0/T_cam_imu missing".into()))?;
        let (r_imu_cam0, t_imu_cam0) = se3_parts(&t_imu_cam0_mat, "cam0/T_cam_imu")?;

        // IMU→cam1 is chained through the stereo extrinsics.
        let t_cn_cnm1_mat = raw
            .cam1
            .t_cn_cnm1
            .ok_or_else(|| ConfigError::Invalid("cam1/T_cn_cnm1 missing".into()))?;
        let (r_cn, t_cn) = se3_parts(&t_cn_cnm1_mat, "cam1/T_cn_cnm1")?;
        let r_imu_cam1 = r_cn * r_imu_cam0;
        let t_imu_cam1 = r_cn * t_imu_cam0 + t_cn;

        let cam0 = build_calibration(&raw.cam0, r_imu_cam0, t_imu_cam0, "cam0")?;
        let cam1 = build_calibration(&raw.cam1, r_imu_cam1, t_imu_cam1, "cam1")?;

        let config = Config {
            cam0,
            cam1,
            processor: raw.processor,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.processor;
        if p.grid_row == 0 || p.grid_col == 0 {
            return Err(ConfigError::Invalid("grid dimensions must be positive".into()));
        }
        if p.grid_min_feature_num > p.grid_max_feature_num {
            return Err(ConfigError::Invalid(format!(
                "grid_min_feature_num ({}) exceeds grid_max_feature_num ({})",
                p.grid_min_feature_num, p.grid_max_feature_num
            )));
        }
        if p.patch_size < 3 || p.patch_size % 2 == 0 {
            return Err(ConfigError::Invalid(format!(
                "patch_size must be odd and at least 3 (got {})",
                p.patch_size
            )));
        }
        if p.track_precision <= 0.0 {
            return Err(ConfigError::Invalid("track_precision must be positive".into()));
        }
        Ok(())
    }

    /// Echo the loaded parameters, mirroring what was read at startup.
    pub fn log_summary(&self) {
        for (name, cam) in [("cam0", &self.cam0), ("cam1", &self.cam1)] {
            info!(
                "{name}: resolution {}x{}, intrinsics [{}, {}, {}, {}], {:?} {:?}",
                cam.resolution[0],
                cam.resolution[1],
                cam.intrinsics.fx,
                cam.intrinsics.fy,
                cam.intrinsics.cx,
                cam.intrinsics.cy,
                cam.distortion_model,
                cam.distortion_coeffs,
            );
        }
        let p = &self.processor;
        info!(
            "grid {}x{} (min {} / max {} per cell), pyramid_levels {}, patch_size {}, \
             fast_threshold {}, max_iteration {}, track_precision {}, \
             ransac_threshold {}, stereo_threshold {}",
            p.grid_row,
            p.grid_col,
            p.grid_min_feature_num,
            p.grid_max_feature_num,
            p.pyramid_levels,
            p.patch_size,
            p.fast_threshold,
            p.max_iteration,
            p.track_precision,
            p.ransac_threshold,
            p.stereo_threshold,
        );
    }
}

fn build_calibration(
    raw: &RawCamera,
    r_imu_cam: Matrix3<f64>,
    t_imu_cam: Vector3<f64>,
    name: &str,
) -> Result<CameraCalibration, ConfigError> {
    if raw.resolution[0] == 0 || raw.resolution[1] == 0 {
        return Err(ConfigError::Invalid(format!("{name}: zero resolution")));
    }
    let [fx, fy, cx, cy] = raw.intrinsics;
    if fx <= 0.0 || fy <= 0.0 {
        return Err(ConfigError::Invalid(format!(
            "{name}: focal lengths must be positive (got {fx}, {fy})"
        )));
    }

    // Invert IMU→cam into the cam→IMU form the pipeline uses.
    let r_cam_imu = r_imu_cam.transpose();
    let t_cam_imu = -r_imu_cam.transpose() * t_imu_cam;

    Ok(CameraCalibration {
        resolution: raw.resolution,
        intrinsics: CameraIntrinsics::new(fx, fy, cx, cy),
        distortion_model: DistortionModel::from_name(&raw.distortion_model),
        distortion_coeffs: raw.distortion_coeffs,
        r_cam_imu,
        t_cam_imu,
    })
}

/// Split a homogeneous 4×4 into rotation and translation, checking the
/// bottom row.
fn se3_parts(
    m: &[[f64; 4]; 4],
    name: &str,
) -> Result<(Matrix3<f64>, Vector3<f64>), ConfigError> {
    let bottom = m[3];
    if (bottom[0].abs() + bottom[1].abs() + bottom[2].abs()) > 1e-9
        || (bottom[3] - 1.0).abs() > 1e-9
    {
        return Err(ConfigError::Invalid(format!(
            "{name}: bottom row of SE(3) matrix must be [0, 0, 0, 1]"
        )));
    }
    let r = Matrix3::new(
        m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
    );
    let t = Vector3::new(m[0][3], m[1][3], m[2][3]);
    Ok((r, t))
}
