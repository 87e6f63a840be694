// convolution.rs — Separable 1D convolution for pyramid construction.
//
// A 2D Gaussian blur with kernel K = k_col * k_row^T decomposes into two
// 1D passes, reducing cost from O(k²) to O(2k) per pixel.
//
// BORDER HANDLING: reflect-101 (mirror without repeating the edge pixel:
// ... p2 p1 | p0 p1 p2 ... ). This keeps blurred pyramid levels unbiased
// at the border, which the coarse-to-fine KLT iteration is sensitive to.

use crate::image::{Image, Pixel};

/// Build a 1D Gaussian kernel with the given half-size and sigma.
///
/// Kernel length is `2 * half_size + 1`, normalized to sum to 1.
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive (got {sigma})");
    let len = 2 * half_size + 1;
    let mut kernel = Vec::with_capacity(len);
    let inv_two_sigma2 = 1.0 / (2.0 * sigma * sigma);
    for i in 0..len {
        let d = i as f32 - half_size as f32;
        kernel.push((-d * d * inv_two_sigma2).exp());
    }
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Mirror an out-of-range coordinate back into [0, n) without repeating
/// the edge sample (reflect-101). Valid while |i| < 2n - 1, which holds
/// for any kernel shorter than the image.
#[inline]
fn reflect_101(i: isize, n: usize) -> usize {
    let n = n as isize;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * n - 2 - i;
    }
    i as usize
}

/// Convolve each row of `src` with a 1D kernel (horizontal pass).
///
/// The kernel is applied centered. Interior pixels use unchecked access;
/// border pixels go through reflect-101 index mapping.
pub fn convolve_rows<T: Pixel>(src: &Image<T>, kernel: &[f32], dst: &mut Image<f32>) {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(
        kernel.len() % 2 == 1,
        "kernel length must be odd (got {})",
        kernel.len()
    );

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    dst.clear_resize(w, h);

    for y in 0..h {
        // Left border.
        for x in 0..half.min(w) {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = reflect_101(x as isize + ki as isize - half as isize, w);
                acc += src.get(sx, y).to_f32() * kv;
            }
            dst.set(x, y, acc);
        }

        // Interior: x in [half, w - half).
        if w > 2 * half {
            for x in half..(w - half) {
                let mut acc = 0.0f32;
                // SAFETY: x - half >= 0 and x + half < w.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        acc += src.get_unchecked(x + ki - half, y).to_f32() * kv;
                    }
                    dst.set_unchecked(x, y, acc);
                }
            }
        }

        // Right border.
        let right_start = if w > half { w - half } else { half.min(w) };
        for x in right_start..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = reflect_101(x as isize + ki as isize - half as isize, w);
                acc += src.get(sx, y).to_f32() * kv;
            }
            dst.set(x, y, acc);
        }
    }
}

/// Convolve each column of `src` with a 1D kernel (vertical pass).
pub fn convolve_cols(src: &Image<f32>, kernel: &[f32], dst: &mut Image<f32>) {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(
        kernel.len() % 2 == 1,
        "kernel length must be odd (got {})",
        kernel.len()
    );

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    dst.clear_resize(w, h);

    // Top border rows.
    for y in 0..half.min(h) {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = reflect_101(y as isize + ki as isize - half as isize, h);
                acc += src.get(x, sy) * kv;
            }
            dst.set(x, y, acc);
        }
    }

    // Interior rows.
    if h > 2 * half {
        for y in half..(h - half) {
            for x in 0..w {
                let mut acc = 0.0f32;
                // SAFETY: y - half >= 0 and y + half < h.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        acc += src.get_unchecked(x, y + ki - half) * kv;
                    }
                    dst.set_unchecked(x, y, acc);
                }
            }
        }
    }

    // Bottom border rows.
    let bottom_start = if h > half { h - half } else { half.min(h) };
    for y in bottom_start..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = reflect_101(y as isize + ki as isize - half as isize, h);
                acc += src.get(x, sy) * kv;
            }
            dst.set(x, y, acc);
        }
    }
}

/// Pre-allocated intermediate buffers for separable convolution.
///
/// Reused across frames so the per-frame pyramid build does not touch
/// the allocator once warm.
pub struct ConvolveScratch {
    /// Output of the horizontal pass.
    intermediate: Image<f32>,
    /// Output of the vertical pass.
    pub output: Image<f32>,
}

impl ConvolveScratch {
    pub fn new(width: usize, height: usize) -> Self {
        ConvolveScratch {
            intermediate: Image::new(width, height),
            output: Image::new(width, height),
        }
    }
}

/// Separable convolution into the scratch's `output` buffer:
/// rows with `k_row`, then columns with `k_col`.
pub fn convolve_separable_into<T: Pixel>(
    src: &Image<T>,
    k_row: &[f32],
    k_col: &[f32],
    scratch: &mut ConvolveScratch,
) {
    convolve_rows(src, k_row, &mut scratch.intermediate);
    convolve_cols(&scratch.intermediate, k_col, &mut scratch.output);
}

/// Allocating convenience wrapper around `convolve_separable_into`.
pub fn convolve_separable<T: Pixel>(src: &Image<T>, k_row: &[f32], k_col: &[f32]) -> Image<f32> {
    let mut scratch = ConvolveScratch::new(src.width(), src.height());
    convolve_separable_into(src, k_row, k_col, &mut scratch);
    scratch.output
}
