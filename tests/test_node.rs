// tests/test_node.rs — End-to-end test of the channel-driven node.

use std::collections::HashSet;
use std::time::Duration;

use nalgebra::{Matrix3, Vector3};

use vio_frontend::camera::{CameraCalibration, CameraIntrinsics, DistortionModel};
use vio_frontend::config::{Config, ProcessorConfig};
use vio_frontend::image::Image;
use vio_frontend::imu::ImuSample;
use vio_frontend::messages::StereoFrame;
use vio_frontend::node::FrontendNode;

const W: usize = 160;
const H: usize = 120;

fn test_config() -> Config {
    let intrinsics = CameraIntrinsics::new(120.0, 120.0, 80.0, 60.0);
    let cam0 = CameraCalibration {
        resolution: [W as u32, H as u32],
        intrinsics,
        distortion_model: DistortionModel::Radtan,
        distortion_coeffs: [0.0; 4],
        r_cam_imu: Matrix3::identity(),
        t_cam_imu: Vector3::zeros(),
    };
    let cam1 = CameraCalibration {
        t_cam_imu: Vector3::new(0.11, 0.0, 0.0),
        ..cam0.clone()
    };
    Config {
        cam0,
        cam1,
        processor: ProcessorConfig {
            grid_row: 4,
            grid_col: 4,
            pyramid_levels: 2,
            patch_size: 15,
            ..ProcessorConfig::default()
        },
    }
}

fn textured_frame(timestamp: f64) -> StereoFrame {
    let mut img = Image::from_vec(W, H, vec![25u8; W * H]);
    let rects: [(usize, usize, usize, usize, u8); 4] = [
        (30, 25, 20, 20, 200),
        (100, 20, 25, 18, 180),
        (35, 70, 24, 22, 190),
        (105, 68, 22, 20, 205),
    ];
    for &(rx, ry, rw, rh, val) in &rects {
        for y in ry..(ry + rh).min(H) {
            for x in rx..(rx + rw).min(W) {
                img.set(x, y, val);
            }
        }
    }
    StereoFrame {
        timestamp,
        cam0_image: img.clone(),
        cam1_image: img,
    }
}

#[test]
fn node_processes_frames_in_order_and_shuts_down() {
    let node = FrontendNode::spawn(test_config());
    let frames = node.frame_sender();
    let imu = node.imu_sender();

    for i in 0..4 {
        let t = 0.05 * i as f64;
        // Gyro samples between frames; the first batch (before frame 0
        // completes) is dropped by contract.
        for j in 0..10 {
            imu.send(ImuSample {
                timestamp: t + 0.005 * j as f64,
                angular_velocity: Vector3::zeros(),
                linear_acceleration: Vector3::new(0.0, 0.0, -9.81),
            })
            .unwrap();
        }
        frames.send(textured_frame(t)).unwrap();
    }

    let mut outputs = Vec::new();
    for _ in 0..4 {
        outputs.push(
            node.outputs()
                .recv_timeout(Duration::from_secs(30))
                .expect("node should produce one output per frame"),
        );
    }

    // Outputs arrive in frame order.
    for (i, out) in outputs.iter().enumerate() {
        assert!((out.measurement.timestamp - 0.05 * i as f64).abs() < 1e-12);
    }

    // A static scene keeps its feature ids across frames.
    assert!(!outputs[0].measurement.features.is_empty());
    let ids0: HashSet<u64> = outputs[0].measurement.features.iter().map(|f| f.id).collect();
    let ids3: HashSet<u64> = outputs[3].measurement.features.iter().map(|f| f.id).collect();
    assert!(
        ids0.intersection(&ids3).count() > 0,
        "features should persist through the node pipeline"
    );

    drop(frames);
    drop(imu);
    node.shutdown();
}

#[test]
fn node_survives_dropped_frames() {
    let node = FrontendNode::spawn(test_config());
    let frames = node.frame_sender();

    frames.send(textured_frame(0.0)).unwrap();
    // Wrong-sized frame: skipped, no output.
    frames
        .send(StereoFrame {
            timestamp: 0.05,
            cam0_image: Image::new(32, 24),
            cam1_image: Image::new(32, 24),
        })
        .unwrap();
    frames.send(textured_frame(0.10)).unwrap();

    let out0 = node.outputs().recv_timeout(Duration::from_secs(30)).unwrap();
    let out1 = node.outputs().recv_timeout(Duration::from_secs(30)).unwrap();
    assert!((out0.measurement.timestamp - 0.0).abs() < 1e-12);
    assert!(
        (out1.measurement.timestamp - 0.10).abs() < 1e-12,
        "the bad frame must be skipped, not published"
    );

    drop(frames);
    node.shutdown();
}
