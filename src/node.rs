// node.rs — Producer queues and the processing thread.
//
// Two external producers drive the front-end: a stereo frame source and
// an IMU source. Each gets its own channel, and a single worker thread
// serializes them: on every frame arrival it first drains the pending
// gyro samples into the processor, then runs the frame to completion.
// This makes the ordering contract explicit — a frame at t_curr sees
// exactly the samples enqueued before it — and deterministic under test.
//
// The frame channel is bounded, so a slow consumer back-pressures the
// producer instead of buffering unboundedly; the IMU channel is
// unbounded here and capped inside the processor's sample buffer.
//
// Shutdown: when every frame sender is dropped the worker finishes the
// in-flight frame, releases its buffers, and exits. `shutdown()` does
// that explicitly and joins the thread.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::debug;

use crate::config::Config;
use crate::imu::ImuSample;
use crate::messages::{FrameOutput, StereoFrame};
use crate::processor::ImageProcessor;

/// In-flight stereo pairs before the producer blocks.
const FRAME_CHANNEL_CAPACITY: usize = 4;

/// Finished frame outputs awaiting the consumer.
const OUTPUT_CHANNEL_CAPACITY: usize = 8;

/// Owns the processing thread and the channel endpoints.
pub struct FrontendNode {
    frame_tx: Sender<StereoFrame>,
    imu_tx: Sender<ImuSample>,
    output_rx: Receiver<FrameOutput>,
    handle: Option<JoinHandle<()>>,
}

impl FrontendNode {
    /// Start the processing thread with the given configuration.
    pub fn spawn(config: Config) -> Self {
        let (frame_tx, frame_rx) = bounded::<StereoFrame>(FRAME_CHANNEL_CAPACITY);
        let (imu_tx, imu_rx) = unbounded::<ImuSample>();
        let (output_tx, output_rx) = bounded::<FrameOutput>(OUTPUT_CHANNEL_CAPACITY);

        let handle = thread::spawn(move || {
            let processor = ImageProcessor::new(config);
            run_loop(processor, frame_rx, imu_rx, output_tx);
        });

        FrontendNode {
            frame_tx,
            imu_tx,
            output_rx,
            handle: Some(handle),
        }
    }

    /// Sender for stereo frames. Blocks when the worker falls behind by
    /// more than the channel capacity.
    pub fn frame_sender(&self) -> Sender<StereoFrame> {
        self.frame_tx.clone()
    }

    /// Sender for IMU samples.
    pub fn imu_sender(&self) -> Sender<ImuSample> {
        self.imu_tx.clone()
    }

    /// Receiver for per-frame outputs.
    pub fn outputs(&self) -> &Receiver<FrameOutput> {
        &self.output_rx
    }

    /// Close this node's producer endpoints and join the worker. The
    /// worker also exits on its own once every cloned frame sender is
    /// dropped.
    pub fn shutdown(mut self) {
        let handle = self.handle.take();
        drop(self);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_loop(
    mut processor: ImageProcessor,
    frame_rx: Receiver<StereoFrame>,
    imu_rx: Receiver<ImuSample>,
    output_tx: Sender<FrameOutput>,
) {
    // Frames drive the loop; recv() parks until the next pair or until
    // every producer hangs up.
    while let Ok(frame) = frame_rx.recv() {
        // All samples enqueued before this frame become visible to it.
        for sample in imu_rx.try_iter() {
            processor.handle_imu(sample);
        }

        match processor.process_stereo(&frame) {
            Ok(output) => {
                // A vanished consumer is not an error for the pipeline;
                // keep state warm for whoever reattaches.
                if output_tx.send(output).is_err() {
                    debug!("output receiver disconnected, discarding frame result");
                }
            }
            Err(err) => {
                debug!("frame skipped: {err}");
            }
        }
    }
}
