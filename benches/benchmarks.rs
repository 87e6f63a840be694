// benches/benchmarks.rs — Hot-path benchmarks: pyramid build, FAST
// detection, and a pyramidal KLT pass at VGA-ish resolution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use vio_frontend::fast::FastDetector;
use vio_frontend::image::Image;
use vio_frontend::klt::PyrLkTracker;
use vio_frontend::pyramid::{Pyramid, PyramidScratch};
use vio_frontend::Point2;

const W: usize = 640;
const H: usize = 480;

/// Deterministic textured image: overlapping gradient blobs.
fn make_image(shift: usize) -> Image<u8> {
    let mut data = vec![0u8; W * H];
    for y in 0..H {
        for x in 0..W {
            let gx = ((x + shift) as f32 * 0.35).sin();
            let gy = (y as f32 * 0.27).cos();
            data[y * W + x] = (127.0 + 100.0 * gx * gy) as u8;
        }
    }
    Image::from_vec(W, H, data)
}

fn bench_pyramid(c: &mut Criterion) {
    let img = make_image(0);
    let mut scratch = PyramidScratch::new(W, H, 1.0);
    let mut pyr = Pyramid::empty();

    c.bench_function("pyramid_build_reuse_640x480_4_levels", |b| {
        b.iter(|| {
            pyr.build_reuse(black_box(&img), 4, &mut scratch);
        })
    });
}

fn bench_fast(c: &mut Criterion) {
    let img = make_image(0);
    let det = FastDetector::new(20, 9);

    c.bench_function("fast_detect_640x480", |b| {
        b.iter(|| black_box(det.detect(black_box(&img))))
    });
}

fn bench_klt(c: &mut Criterion) {
    let pyr1 = Pyramid::build(&make_image(0), 4, 1.0);
    let pyr2 = Pyramid::build(&make_image(2), 4, 1.0);
    let tracker = PyrLkTracker::new(15, 30, 0.01, 3);

    let pts: Vec<Point2> = (0..50)
        .map(|i| Point2::new(60.0 + 10.0 * i as f64 % 520.0, 40.0 + 7.9 * i as f64 % 400.0))
        .collect();

    c.bench_function("klt_track_50_points", |b| {
        b.iter(|| black_box(tracker.track(&pyr1, &pyr2, black_box(&pts), black_box(&pts))))
    });
}

criterion_group!(benches, bench_pyramid, bench_fast, bench_klt);
criterion_main!(benches);
