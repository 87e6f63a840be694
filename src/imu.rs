// imu.rs — Gyro sample buffering and short-term rotation integration.
//
// The front-end only needs a coarse relative rotation between consecutive
// frames to seed KLT and to rotation-compensate the two-point RANSAC. It
// averages the angular velocity over the samples spanning
// [t_prev − lead, t_curr + lag), maps it into each camera frame through
// the IMU extrinsics, and exponentiates:
//
//   R_{prev→curr}^{cam} = exp([R_cam_imu^T ω̄ · Δt]_×)^T
//
// (the transpose converts the frame rotation into the vector rotation the
// pipeline applies to bearings). Consumed and skipped samples are erased;
// an empty window yields identity rotations, which degrades prediction
// but never fails the pipeline.

use std::collections::VecDeque;

use nalgebra::{Matrix3, Rotation3, Vector3};

use crate::camera::CameraCalibration;

/// A single inertial measurement.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Sample time in seconds.
    pub timestamp: f64,
    /// Angular velocity in the IMU frame (rad/s).
    pub angular_velocity: Vector3<f64>,
    /// Linear acceleration in the IMU frame (m/s²). Buffered for
    /// completeness; rotation integration does not consume it.
    pub linear_acceleration: Vector3<f64>,
}

/// FIFO of IMU samples awaiting integration.
///
/// Bounded: when a producer outruns the frame consumer, the oldest
/// samples are dropped rather than growing without limit.
pub struct ImuBuffer {
    samples: VecDeque<ImuSample>,
    capacity: usize,
}

impl ImuBuffer {
    /// Default capacity: at 200 Hz gyro and 20 Hz frames this is ~10 s of
    /// producer/consumer mismatch before samples are lost.
    pub const DEFAULT_CAPACITY: usize = 2000;

    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        ImuBuffer {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, dropping the oldest if the buffer is full.
    pub fn push(&mut self, sample: ImuSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Integrate the mean angular velocity over the window
    /// `[t_prev − lead, t_curr + lag)` and return the per-camera relative
    /// rotations `(R_{p→c}^{cam0}, R_{p→c}^{cam1})`.
    ///
    /// Every sample up to the end of the window — including ones too old
    /// to participate — is removed; a sample never serves two frames.
    pub fn integrate(
        &mut self,
        t_prev: f64,
        t_curr: f64,
        lead: f64,
        lag: f64,
        cam0: &CameraCalibration,
        cam1: &CameraCalibration,
    ) -> (Matrix3<f64>, Matrix3<f64>) {
        // Window start: skip samples more than `lead` before the previous
        // frame.
        let mut begin = 0;
        while begin < self.samples.len() && self.samples[begin].timestamp - t_prev < -lead {
            begin += 1;
        }

        // Window end: advance while samples are less than `lag` after the
        // current frame.
        let mut end = begin;
        while end < self.samples.len() && self.samples[end].timestamp - t_curr < lag {
            end += 1;
        }

        let mut mean_ang_vel = Vector3::zeros();
        if end > begin {
            for s in self.samples.range(begin..end) {
                mean_ang_vel += s.angular_velocity;
            }
            mean_ang_vel /= (end - begin) as f64;
        }

        let dt = t_curr - t_prev;
        let cam0_ang_vel = cam0.r_cam_imu.transpose() * mean_ang_vel;
        let cam1_ang_vel = cam1.r_cam_imu.transpose() * mean_ang_vel;

        let r0 = Rotation3::new(cam0_ang_vel * dt).matrix().transpose();
        let r1 = Rotation3::new(cam1_ang_vel * dt).matrix().transpose();

        self.samples.drain(..end);

        (r0, r1)
    }
}

impl Default for ImuBuffer {
    fn default() -> Self {
        ImuBuffer::new(Self::DEFAULT_CAPACITY)
    }
}
