// vio-frontend: stereo visual-inertial odometry front-end.
//
// Ingests time-stamped synchronized stereo image pairs and gyro samples,
// and produces a stream of stereo feature observations (left/right point
// correspondences persisted across frames by a stable id) for a
// downstream filter-based estimator.
//
// Per-frame pipeline: build pyramids → temporal KLT (IMU-predicted
// initial flow) → stereo KLT (extrinsics-seeded) → epipolar reject →
// two-point RANSAC per camera → grid-balanced replenishment from FAST.

pub mod camera;
pub mod config;
pub mod convolution;
pub mod fast;
pub mod grid;
pub mod image;
pub mod imu;
pub mod klt;
pub mod messages;
pub mod node;
pub mod processor;
pub mod pyramid;
pub mod ransac;
pub mod stereo;

/// Feature point in pixel or normalized camera coordinates.
pub type Point2 = nalgebra::Point2<f64>;

/// Errors surfaced by the front-end.
///
/// Everything here is local to one frame except `Config`, which is fatal
/// at startup. Degenerate motion, empty IMU windows, and singular RANSAC
/// refits are handled internally and never reach this enum.
#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    /// The frame cannot be processed; previous-frame state is untouched.
    #[error("frame at t={timestamp}s dropped: {reason}")]
    FrameDropped { timestamp: f64, reason: String },

    /// Temporal point sets handed to RANSAC disagree in length.
    #[error("point sets of different size ({0} and {1})")]
    PointSetMismatch(usize, usize),

    /// Missing or malformed calibration/parameters.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}
