// messages.rs — Inbound and outbound message types.
//
// The transport itself is external; these are the payloads the front-end
// consumes and produces. Outbound types derive Serialize so consumers can
// log or ship them without re-wrapping.

use serde::Serialize;

use crate::grid::FeatureId;
use crate::image::Image;

/// A time-stamped synchronized stereo pair, 8-bit mono.
pub struct StereoFrame {
    /// Frame time in seconds.
    pub timestamp: f64,
    pub cam0_image: Image<u8>,
    pub cam1_image: Image<u8>,
}

/// One published stereo observation.
///
/// Coordinates are **undistorted normalized camera coordinates** on the
/// z = 1 plane, not pixels: (u0, v0) in cam0, (u1, v1) in cam1.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureMeasurement {
    pub id: FeatureId,
    pub u0: f64,
    pub v0: f64,
    pub u1: f64,
    pub v1: f64,
}

/// All stereo observations for one frame.
#[derive(Debug, Clone, Serialize)]
pub struct CameraMeasurement {
    /// Frame time in seconds.
    pub timestamp: f64,
    pub features: Vec<FeatureMeasurement>,
}

/// Per-frame survival counters through the rejection cascade.
///
/// `before_tracking ≥ after_tracking ≥ after_matching ≥ after_ransac`
/// holds for every frame.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TrackingInfo {
    /// Frame time in seconds.
    pub timestamp: f64,
    /// Features carried in from the previous frame.
    pub before_tracking: u32,
    /// Survivors of temporal KLT (and bounds rejection).
    pub after_tracking: u32,
    /// Survivors of stereo re-matching.
    pub after_matching: u32,
    /// Survivors of two-point RANSAC on both cameras.
    pub after_ransac: u32,
}

/// Everything the front-end emits for one processed frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameOutput {
    pub measurement: CameraMeasurement,
    pub tracking_info: TrackingInfo,
}
