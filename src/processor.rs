// processor.rs — Per-frame orchestration of the tracking pipeline.
//
// State machine: the first usable stereo pair seeds the feature store
// (FAST → stereo match → grid-balanced admission); every later frame runs
// the steady-state cascade:
//
//   integrate gyro → temporal KLT (predicted initial flow) → stereo
//   re-match → two-point RANSAC per camera → re-bucket survivors →
//   replenish under-filled cells from masked FAST → prune over-full
//   cells → publish undistorted normalized observations.
//
// The processor owns all cross-frame state: previous/current feature
// stores and the cam0 pyramids are double-buffered by swap, so the
// steady-state loop performs no image-sized allocation. All errors are
// local to one frame; a dropped frame leaves the previous state intact
// and the next frame retries from the same baseline.

use std::collections::{BTreeMap, HashSet};

use nalgebra::Matrix3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::camera::{CameraCalibration, CameraIntrinsics};
use crate::config::{Config, ProcessorConfig};
use crate::fast::{FastDetector, Keypoint};
use crate::grid::{FeatureId, FeatureRecord, GridStore};
use crate::image::Image;
use crate::imu::{ImuBuffer, ImuSample};
use crate::klt::PyrLkTracker;
use crate::messages::{
    CameraMeasurement, FeatureMeasurement, FrameOutput, StereoFrame, TrackingInfo,
};
use crate::pyramid::{Pyramid, PyramidScratch};
use crate::ransac::two_point_ransac;
use crate::stereo::stereo_match;
use crate::{FrontendError, Point2};

/// Blur strength for pyramid construction.
const PYRAMID_SIGMA: f32 = 1.0;

/// FAST-N arc length; FAST-9 is the conventional high-recall setting.
const FAST_ARC_LENGTH: usize = 9;

/// RANSAC success probability (drives the iteration count).
const RANSAC_CONFIDENCE: f64 = 0.99;

/// Stereo visual-inertial front-end processor.
pub struct ImageProcessor {
    cam0: CameraCalibration,
    cam1: CameraCalibration,
    config: ProcessorConfig,

    detector: FastDetector,
    tracker: PyrLkTracker,
    rng: ChaCha8Rng,

    /// True until a first frame admits at least one feature.
    is_first_img: bool,
    prev_stamp: f64,
    next_feature_id: FeatureId,

    prev_features: GridStore,
    curr_features: GridStore,

    prev_cam0_pyramid: Pyramid,
    curr_cam0_pyramid: Pyramid,
    curr_cam1_pyramid: Pyramid,
    pyramid_scratch: PyramidScratch,

    imu_buffer: ImuBuffer,

    /// Reused detection mask for the replenishment stage.
    mask: Image<u8>,

    // Survival counters for the frame in flight.
    before_tracking: u32,
    after_tracking: u32,
    after_matching: u32,
    after_ransac: u32,

    /// Histogram over the final lifetimes of retired features.
    lifetime_histogram: BTreeMap<u32, u32>,
}

impl ImageProcessor {
    pub fn new(config: Config) -> Self {
        config.log_summary();

        let Config {
            cam0,
            cam1,
            processor,
        } = config;

        let width = cam0.resolution[0] as usize;
        let height = cam0.resolution[1] as usize;

        let detector = FastDetector::new(processor.fast_threshold, FAST_ARC_LENGTH);
        let tracker = PyrLkTracker::new(
            processor.patch_size,
            processor.max_iteration,
            processor.track_precision as f32,
            processor.pyramid_levels,
        );
        let rng = ChaCha8Rng::seed_from_u64(processor.ransac_seed);

        ImageProcessor {
            detector,
            tracker,
            rng,
            is_first_img: true,
            prev_stamp: 0.0,
            next_feature_id: 0,
            prev_features: GridStore::new(processor.grid_row, processor.grid_col, width, height),
            curr_features: GridStore::new(processor.grid_row, processor.grid_col, width, height),
            prev_cam0_pyramid: Pyramid::empty(),
            curr_cam0_pyramid: Pyramid::empty(),
            curr_cam1_pyramid: Pyramid::empty(),
            pyramid_scratch: PyramidScratch::new(width, height, PYRAMID_SIGMA),
            imu_buffer: ImuBuffer::default(),
            mask: Image::new(width, height),
            before_tracking: 0,
            after_tracking: 0,
            after_matching: 0,
            after_ransac: 0,
            lifetime_histogram: BTreeMap::new(),
            cam0,
            cam1,
            config: processor,
        }
    }

    /// Enqueue a gyro sample. Samples arriving before the first tracked
    /// frame are dropped; nothing could consume them.
    pub fn handle_imu(&mut self, sample: ImuSample) {
        if self.is_first_img {
            return;
        }
        self.imu_buffer.push(sample);
    }

    /// Process one stereo pair through the full cascade and return the
    /// frame's observations and counters.
    pub fn process_stereo(&mut self, frame: &StereoFrame) -> Result<FrameOutput, FrontendError> {
        self.check_frame(frame)?;

        let levels = self.config.pyramid_levels + 1;
        self.curr_cam0_pyramid
            .build_reuse(&frame.cam0_image, levels, &mut self.pyramid_scratch);
        self.curr_cam1_pyramid
            .build_reuse(&frame.cam1_image, levels, &mut self.pyramid_scratch);

        self.before_tracking = 0;
        self.after_tracking = 0;
        self.after_matching = 0;
        self.after_ransac = 0;

        if self.is_first_img {
            let admitted = self.initialize_first_frame(frame);
            if admitted > 0 {
                self.is_first_img = false;
                debug!("first frame initialized with {admitted} stereo features");
            } else {
                warn!(
                    "first frame at t={} produced no stereo features, retrying",
                    frame.timestamp
                );
            }
        } else {
            self.track_features(frame)?;
            self.add_new_features(frame);
            self.prune_grid_features();
        }

        let output = self.publish(frame);
        self.finalize_frame(frame);
        Ok(output)
    }

    /// Features of the most recently completed frame (id, positions,
    /// lifetime), for external debug overlays.
    pub fn last_frame_features(&self) -> impl Iterator<Item = &FeatureRecord> + '_ {
        self.prev_features.iter()
    }

    /// Histogram over the final lifetimes of all features retired so far.
    pub fn lifetime_statistics(&self) -> &BTreeMap<u32, u32> {
        &self.lifetime_histogram
    }

    pub fn is_initialized(&self) -> bool {
        !self.is_first_img
    }

    /// Reject frames whose dimensions disagree with the calibration
    /// before any state is touched.
    fn check_frame(&self, frame: &StereoFrame) -> Result<(), FrontendError> {
        for (name, image, cal) in [
            ("cam0", &frame.cam0_image, &self.cam0),
            ("cam1", &frame.cam1_image, &self.cam1),
        ] {
            if image.width() != cal.resolution[0] as usize
                || image.height() != cal.resolution[1] as usize
            {
                let reason = format!(
                    "{name} image is {}x{}, calibration expects {}x{}",
                    image.width(),
                    image.height(),
                    cal.resolution[0],
                    cal.resolution[1],
                );
                warn!("dropping frame at t={}: {reason}", frame.timestamp);
                return Err(FrontendError::FrameDropped {
                    timestamp: frame.timestamp,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Detect, stereo-match, and admit the initial feature set. Returns
    /// the number of admitted features.
    fn initialize_first_frame(&mut self, frame: &StereoFrame) -> usize {
        let keypoints = self.detector.detect(&frame.cam0_image);
        let cam0_points: Vec<Point2> = keypoints.iter().map(|k| k.pt).collect();

        let (cam1_points, markers) = stereo_match(
            &cam0_points,
            &[],
            &self.curr_cam0_pyramid,
            &self.curr_cam1_pyramid,
            &self.cam0,
            &self.cam1,
            &self.tracker,
            self.config.stereo_threshold,
        );

        // Bucket the stereo-verified detections, strongest response first,
        // and admit up to the per-cell minimum.
        let mut candidates = GridStore::new(
            self.config.grid_row,
            self.config.grid_col,
            frame.cam0_image.width(),
            frame.cam0_image.height(),
        );
        for (i, keypoint) in keypoints.iter().enumerate() {
            if markers[i] == 0 {
                continue;
            }
            candidates.insert(FeatureRecord {
                id: 0,
                response: keypoint.response,
                lifetime: 1,
                cam0_point: cam0_points[i],
                cam1_point: cam1_points[i],
            });
        }

        let mut admitted = 0;
        for code in 0..candidates.num_cells() {
            candidates.sort_cell_by_response(code);
            for record in candidates
                .cell(code)
                .iter()
                .take(self.config.grid_min_feature_num)
            {
                let mut record = record.clone();
                record.id = self.next_feature_id;
                self.next_feature_id += 1;
                self.curr_features.insert(record);
                admitted += 1;
            }
        }
        admitted
    }

    /// Steady-state stages b–f: temporal tracking, stereo re-matching,
    /// and the per-camera RANSAC gates.
    ///
    /// Outlier removal closes a loop between the previous and current
    /// frames of both cameras. Assuming the previous stereo match was
    /// correct, the three checks are: (1) stereo matching between the
    /// current cam0 and cam1 images, (2) RANSAC between previous and
    /// current cam0, (3) RANSAC between previous and current cam1 — for
    /// which no further tracking is needed, the stereo matches feed the
    /// RANSAC directly.
    fn track_features(&mut self, frame: &StereoFrame) -> Result<(), FrontendError> {
        let (cam0_r_p_c, cam1_r_p_c) = self.imu_buffer.integrate(
            self.prev_stamp,
            frame.timestamp,
            self.config.imu_window_lead,
            self.config.imu_window_lag,
            &self.cam0,
            &self.cam1,
        );

        // Flatten the previous store into parallel arrays.
        let mut prev_ids: Vec<FeatureId> = Vec::new();
        let mut prev_lifetimes: Vec<u32> = Vec::new();
        let mut prev_cam0_points: Vec<Point2> = Vec::new();
        let mut prev_cam1_points: Vec<Point2> = Vec::new();
        for record in self.prev_features.iter() {
            prev_ids.push(record.id);
            prev_lifetimes.push(record.lifetime);
            prev_cam0_points.push(record.cam0_point);
            prev_cam1_points.push(record.cam1_point);
        }

        self.before_tracking = prev_cam0_points.len() as u32;
        if prev_ids.is_empty() {
            return Ok(());
        }

        // Temporal KLT, seeded with the rotation-predicted positions.
        let predicted =
            predict_feature_tracking(&prev_cam0_points, &cam0_r_p_c, &self.cam0.intrinsics);
        let (curr_cam0_points, mut track_markers) = self.tracker.track(
            &self.prev_cam0_pyramid,
            &self.curr_cam0_pyramid,
            &prev_cam0_points,
            &predicted,
        );
        for (i, p) in curr_cam0_points.iter().enumerate() {
            if track_markers[i] != 0 && !self.cam0.contains(p) {
                track_markers[i] = 0;
            }
        }

        let prev_ids = remove_unmarked(&prev_ids, &track_markers);
        let prev_lifetimes = remove_unmarked(&prev_lifetimes, &track_markers);
        let prev_cam0_points = remove_unmarked(&prev_cam0_points, &track_markers);
        let prev_cam1_points = remove_unmarked(&prev_cam1_points, &track_markers);
        let curr_cam0_points = remove_unmarked(&curr_cam0_points, &track_markers);

        self.after_tracking = curr_cam0_points.len() as u32;

        // Stereo re-match of the survivors.
        let (curr_cam1_points, match_markers) = stereo_match(
            &curr_cam0_points,
            &[],
            &self.curr_cam0_pyramid,
            &self.curr_cam1_pyramid,
            &self.cam0,
            &self.cam1,
            &self.tracker,
            self.config.stereo_threshold,
        );

        let prev_ids = remove_unmarked(&prev_ids, &match_markers);
        let mut prev_lifetimes = remove_unmarked(&prev_lifetimes, &match_markers);
        let prev_cam0_points = remove_unmarked(&prev_cam0_points, &match_markers);
        let prev_cam1_points = remove_unmarked(&prev_cam1_points, &match_markers);
        let curr_cam0_points = remove_unmarked(&curr_cam0_points, &match_markers);
        let curr_cam1_points = remove_unmarked(&curr_cam1_points, &match_markers);

        self.after_matching = curr_cam0_points.len() as u32;

        // Temporal RANSAC on each camera; a feature survives only if both
        // cameras accept it.
        let cam0_inliers = two_point_ransac(
            &prev_cam0_points,
            &curr_cam0_points,
            &cam0_r_p_c,
            &self.cam0,
            self.config.ransac_threshold,
            RANSAC_CONFIDENCE,
            &mut self.rng,
        )?;
        let cam1_inliers = two_point_ransac(
            &prev_cam1_points,
            &curr_cam1_points,
            &cam1_r_p_c,
            &self.cam1,
            self.config.ransac_threshold,
            RANSAC_CONFIDENCE,
            &mut self.rng,
        )?;

        for i in 0..curr_cam0_points.len() {
            if cam0_inliers[i] == 0 || cam1_inliers[i] == 0 {
                continue;
            }
            prev_lifetimes[i] += 1;
            self.curr_features.insert(FeatureRecord {
                id: prev_ids[i],
                response: 0.0,
                lifetime: prev_lifetimes[i],
                cam0_point: curr_cam0_points[i],
                cam1_point: curr_cam1_points[i],
            });
            self.after_ransac += 1;
        }

        let prev_num = self.prev_features.count();
        let curr_num = self.curr_features.count();
        debug!(
            "candidates: {}; track: {}; match: {}; ransac: {}/{}={:.3}",
            self.before_tracking,
            self.after_tracking,
            self.after_matching,
            curr_num,
            prev_num,
            curr_num as f64 / (prev_num as f64 + 1e-5),
        );

        Ok(())
    }

    /// Replenish under-filled grid cells with fresh stereo-verified FAST
    /// detections, masked away from the features already tracked.
    fn add_new_features(&mut self, frame: &StereoFrame) {
        let width = frame.cam0_image.width();
        let height = frame.cam0_image.height();

        // Suppress detection in a 5×5 neighborhood of every live feature.
        self.mask.clear_resize(width, height);
        self.mask.fill(1);
        for record in self.curr_features.iter() {
            let x = record.cam0_point.x as isize;
            let y = record.cam0_point.y as isize;
            let x_range = (x - 2).max(0) as usize..((x + 3).max(0) as usize).min(width);
            let y_range = (y - 2).max(0) as usize..((y + 3).max(0) as usize).min(height);
            for my in y_range {
                for mx in x_range.clone() {
                    self.mask.set(mx, my, 0);
                }
            }
        }

        let mut keypoints = self.detector.detect_masked(&frame.cam0_image, Some(&self.mask));
        let detected_new_features = keypoints.len();

        // Sieve raw detections per cell: cap at the per-cell maximum by
        // response before paying for stereo matching.
        let mut sieve: Vec<Vec<Keypoint>> = (0..self.curr_features.num_cells())
            .map(|_| Vec::new())
            .collect();
        for keypoint in keypoints.drain(..) {
            let code = self.curr_features.cell_code(&keypoint.pt);
            sieve[code].push(keypoint);
        }
        let mut new_keypoints = Vec::new();
        for mut cell in sieve {
            if cell.len() > self.config.grid_max_feature_num {
                cell.sort_by(|a, b| b.response.total_cmp(&a.response));
                cell.truncate(self.config.grid_max_feature_num);
            }
            new_keypoints.extend(cell);
        }

        let cam0_points: Vec<Point2> = new_keypoints.iter().map(|k| k.pt).collect();
        let (cam1_points, markers) = stereo_match(
            &cam0_points,
            &[],
            &self.curr_cam0_pyramid,
            &self.curr_cam1_pyramid,
            &self.cam0,
            &self.cam1,
            &self.tracker,
            self.config.stereo_threshold,
        );

        let matched_new_features = markers.iter().filter(|&&m| m != 0).count();
        if detected_new_features > 0
            && matched_new_features < 5
            && (matched_new_features as f64) / (detected_new_features as f64) < 0.1
        {
            warn!(
                "images at t={} seem unsynced: {} of {} new detections stereo-matched",
                frame.timestamp, matched_new_features, detected_new_features
            );
        }

        let mut candidates = GridStore::new(
            self.config.grid_row,
            self.config.grid_col,
            width,
            height,
        );
        for (i, keypoint) in new_keypoints.iter().enumerate() {
            if markers[i] == 0 {
                continue;
            }
            candidates.insert(FeatureRecord {
                id: 0,
                response: keypoint.response,
                lifetime: 1,
                cam0_point: cam0_points[i],
                cam1_point: cam1_points[i],
            });
        }

        // Fill each under-populated cell up to the minimum, strongest
        // response first.
        for code in 0..candidates.num_cells() {
            let occupied = self.curr_features.cell(code).len();
            if occupied >= self.config.grid_min_feature_num {
                continue;
            }
            let vacancy = self.config.grid_min_feature_num - occupied;
            candidates.sort_cell_by_response(code);
            for record in candidates.cell(code).iter().take(vacancy) {
                let mut record = record.clone();
                record.id = self.next_feature_id;
                self.next_feature_id += 1;
                self.curr_features.insert(record);
            }
        }
    }

    /// Enforce the per-cell cap, keeping the longest-tracked features.
    fn prune_grid_features(&mut self) {
        for code in 0..self.curr_features.num_cells() {
            self.curr_features
                .prune_cell(code, self.config.grid_max_feature_num);
        }
    }

    /// Undistort the surviving features and assemble the outbound
    /// messages.
    fn publish(&mut self, frame: &StereoFrame) -> FrameOutput {
        let mut ids: Vec<FeatureId> = Vec::new();
        let mut cam0_points: Vec<Point2> = Vec::new();
        let mut cam1_points: Vec<Point2> = Vec::new();
        for record in self.curr_features.iter() {
            ids.push(record.id);
            cam0_points.push(record.cam0_point);
            cam1_points.push(record.cam1_point);
        }

        let cam0_undistorted = self.cam0.undistort(&cam0_points);
        let cam1_undistorted = self.cam1.undistort(&cam1_points);

        let features = ids
            .iter()
            .zip(cam0_undistorted.iter().zip(cam1_undistorted.iter()))
            .map(|(&id, (p0, p1))| FeatureMeasurement {
                id,
                u0: p0.x,
                v0: p0.y,
                u1: p1.x,
                v1: p1.y,
            })
            .collect();

        FrameOutput {
            measurement: CameraMeasurement {
                timestamp: frame.timestamp,
                features,
            },
            tracking_info: TrackingInfo {
                timestamp: frame.timestamp,
                before_tracking: self.before_tracking,
                after_tracking: self.after_tracking,
                after_matching: self.after_matching,
                after_ransac: self.after_ransac,
            },
        }
    }

    /// Record retired lifetimes, swap the double buffers, and reset the
    /// new current store.
    fn finalize_frame(&mut self, frame: &StereoFrame) {
        let surviving: HashSet<FeatureId> = self.curr_features.iter().map(|r| r.id).collect();
        for record in self.prev_features.iter() {
            if !surviving.contains(&record.id) {
                *self.lifetime_histogram.entry(record.lifetime).or_insert(0) += 1;
            }
        }

        std::mem::swap(&mut self.prev_cam0_pyramid, &mut self.curr_cam0_pyramid);
        std::mem::swap(&mut self.prev_features, &mut self.curr_features);
        self.curr_features
            .reset(frame.cam0_image.width(), frame.cam0_image.height());
        self.prev_stamp = frame.timestamp;
    }
}

/// Predict current-frame pixel positions from the gyro-integrated
/// rotation: `p_pred = K · R_{p→c} · K⁻¹ · [p; 1]` in homogeneous form.
/// A zero rotation reproduces the input, so IMU starvation degrades to
/// zero-motion seeding.
fn predict_feature_tracking(
    points: &[Point2],
    r_p_c: &Matrix3<f64>,
    intrinsics: &CameraIntrinsics,
) -> Vec<Point2> {
    if points.is_empty() {
        return Vec::new();
    }

    let k = intrinsics.k_matrix();
    let k_inv = Matrix3::new(
        1.0 / intrinsics.fx,
        0.0,
        -intrinsics.cx / intrinsics.fx,
        0.0,
        1.0 / intrinsics.fy,
        -intrinsics.cy / intrinsics.fy,
        0.0,
        0.0,
        1.0,
    );
    let h = k * r_p_c * k_inv;

    points
        .iter()
        .map(|p| {
            let v = h * nalgebra::Vector3::new(p.x, p.y, 1.0);
            Point2::new(v.x / v.z, v.y / v.z)
        })
        .collect()
}

/// Keep the elements whose marker byte is nonzero.
fn remove_unmarked<T: Clone>(items: &[T], markers: &[u8]) -> Vec<T> {
    debug_assert_eq!(items.len(), markers.len());
    items
        .iter()
        .zip(markers.iter())
        .filter(|(_, &m)| m != 0)
        .map(|(item, _)| item.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Rotation3, Vector3};

    #[test]
    fn test_predict_identity_rotation() {
        let k = CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0);
        let pts = vec![Point2::new(100.0, 50.0), Point2::new(500.0, 400.0)];
        let out = predict_feature_tracking(&pts, &Matrix3::identity(), &k);
        for (p, q) in pts.iter().zip(out.iter()) {
            assert!((p.x - q.x).abs() < 1e-9 && (p.y - q.y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_predict_yaw_rotates_about_principal_point() {
        // A camera-z rotation spins pixels around the principal point
        // (for fx = fy); the principal point itself is a fixed point.
        let k = CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0);
        let r = *Rotation3::new(Vector3::new(0.0, 0.0, 0.1)).matrix();

        let pts = vec![Point2::new(320.0, 240.0), Point2::new(420.0, 240.0)];
        let out = predict_feature_tracking(&pts, &r, &k);

        assert!((out[0].x - 320.0).abs() < 1e-9 && (out[0].y - 240.0).abs() < 1e-9);
        let d_before = ((pts[1].x - 320.0f64).powi(2) + (pts[1].y - 240.0f64).powi(2)).sqrt();
        let d_after = ((out[1].x - 320.0f64).powi(2) + (out[1].y - 240.0f64).powi(2)).sqrt();
        assert!(
            (d_before - d_after).abs() < 1e-6,
            "radius should be preserved: {d_before} vs {d_after}"
        );
        assert!((out[1].y - 240.0).abs() > 1.0, "point should have moved tangentially");
    }

    #[test]
    fn test_remove_unmarked() {
        let items = vec![10, 20, 30, 40];
        let markers = vec![1u8, 0, 1, 0];
        assert_eq!(remove_unmarked(&items, &markers), vec![10, 30]);
    }
}
