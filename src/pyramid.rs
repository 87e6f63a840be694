// pyramid.rs — Gaussian image pyramid for pyramidal Lucas-Kanade.
//
// Level 0 is the input at full resolution (converted to f32); each
// subsequent level is Gaussian-blurred then decimated 2×. For a tracker
// configured with `pyramid_levels`, the pyramid holds
// `pyramid_levels + 1` images so the coarse-to-fine sweep has a level
// above the finest one.
//
// Per-frame construction goes through `build_reuse` with a
// `PyramidScratch`: the current/previous pyramids are swapped at frame
// end and their buffers rewritten in place, so steady state does no
// image-sized allocation.

use crate::convolution::{convolve_separable_into, gaussian_kernel_1d, ConvolveScratch};
use crate::image::{Image, Pixel};

/// A Gaussian image pyramid.
///
/// `levels[0]` is the original resolution; `levels[n]` is approximately
/// `(width / 2^n, height / 2^n)`. All levels are `Image<f32>`: blur
/// accumulation and KLT sub-pixel interpolation both want f32, and
/// storing it avoids re-converting per level.
pub struct Pyramid {
    /// Pyramid levels, from finest (index 0) to coarsest.
    pub levels: Vec<Image<f32>>,
}

/// Pre-allocated scratch buffers for pyramid construction.
pub struct PyramidScratch {
    conv: ConvolveScratch,
    kernel: Vec<f32>,
}

impl PyramidScratch {
    /// Create scratch buffers for the given image dimensions and sigma.
    pub fn new(width: usize, height: usize, sigma: f32) -> Self {
        let half_size = (3.0 * sigma).ceil().max(1.0) as usize;
        PyramidScratch {
            conv: ConvolveScratch::new(width, height),
            kernel: gaussian_kernel_1d(half_size, sigma),
        }
    }
}

impl Pyramid {
    /// An empty pyramid, to be filled by `build_reuse`.
    pub fn empty() -> Self {
        Pyramid { levels: Vec::new() }
    }

    /// Build a pyramid with `num_levels` total images, allocating fresh
    /// buffers. For per-frame use prefer `build_reuse`.
    pub fn build<T: Pixel>(src: &Image<T>, num_levels: usize, sigma: f32) -> Self {
        let mut pyr = Pyramid::empty();
        let mut scratch = PyramidScratch::new(src.width(), src.height(), sigma);
        pyr.build_reuse(src, num_levels, &mut scratch);
        pyr
    }

    /// Build a pyramid, reusing this pyramid's existing level buffers and
    /// the caller's scratch. On first use the levels are allocated; on
    /// subsequent calls they are rewritten in place.
    pub fn build_reuse<T: Pixel>(
        &mut self,
        src: &Image<T>,
        num_levels: usize,
        scratch: &mut PyramidScratch,
    ) {
        assert!(num_levels >= 1, "pyramid must have at least 1 level");

        while self.levels.len() < num_levels {
            self.levels.push(Image::new(1, 1));
        }
        self.levels.truncate(num_levels);

        // Level 0: convert source to f32 in place.
        to_f32_into(src, &mut self.levels[0]);

        // Each subsequent level: blur the previous, decimate 2×.
        for i in 1..num_levels {
            let (prev_levels, curr_levels) = self.levels.split_at_mut(i);
            let prev = &prev_levels[i - 1];

            convolve_separable_into(prev, &scratch.kernel, &scratch.kernel, &mut scratch.conv);
            downsample_2x_into(&scratch.conv.output, &mut curr_levels[0]);
        }
    }

    /// Number of pyramid levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Get a reference to a specific level.
    pub fn level(&self, level: usize) -> &Image<f32> {
        &self.levels[level]
    }
}

/// Decimate 2×: `dst(x, y) = src(2x, 2y)`, integer-division dimensions.
fn downsample_2x_into(src: &Image<f32>, dst: &mut Image<f32>) {
    let new_w = src.width() / 2;
    let new_h = src.height() / 2;
    dst.clear_resize(new_w, new_h);

    for y in 0..new_h {
        for x in 0..new_w {
            // SAFETY: 2x < width and 2y < height since x < width/2, y < height/2.
            unsafe {
                dst.set_unchecked(x, y, src.get_unchecked(x * 2, y * 2));
            }
        }
    }
}

fn to_f32_into<T: Pixel>(src: &Image<T>, dst: &mut Image<f32>) {
    dst.clear_resize(src.width(), src.height());
    for y in 0..src.height() {
        for x in 0..src.width() {
            // SAFETY: (x, y) iterates exactly the shared dimensions.
            unsafe {
                dst.set_unchecked(x, y, src.get_unchecked(x, y).to_f32());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_level_dimensions() {
        let img: Image<u8> = Image::new(640, 480);
        let pyr = Pyramid::build(&img, 4, 1.0);

        assert_eq!(pyr.num_levels(), 4);
        assert_eq!(pyr.levels[0].width(), 640);
        assert_eq!(pyr.levels[0].height(), 480);
        assert_eq!(pyr.levels[1].width(), 320);
        assert_eq!(pyr.levels[2].width(), 160);
        assert_eq!(pyr.levels[3].width(), 80);
        assert_eq!(pyr.levels[3].height(), 60);
    }

    #[test]
    fn test_pyramid_single_level() {
        let data: Vec<u8> = vec![10, 20, 30, 40];
        let img = Image::from_vec(2, 2, data);
        let pyr = Pyramid::build(&img, 1, 1.0);

        assert_eq!(pyr.num_levels(), 1);
        assert!((pyr.levels[0].get(0, 0) - 10.0).abs() < 1e-6);
        assert!((pyr.levels[0].get(1, 1) - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_pyramid_constant_image() {
        // Constant stays constant at every level: blur of constant is
        // constant, decimation of constant is constant.
        let img = Image::from_vec(64, 64, vec![128u8; 64 * 64]);
        let pyr = Pyramid::build(&img, 4, 1.0);

        for (lvl, level) in pyr.levels.iter().enumerate() {
            for (x, y, v) in level.pixels() {
                assert!(
                    (v - 128.0).abs() < 0.5,
                    "level {lvl} pixel ({x},{y}) = {v}, expected 128.0"
                );
            }
        }
    }

    #[test]
    fn test_build_reuse_matches_build() {
        let mut data = vec![0u8; 64 * 48];
        for (i, v) in data.iter_mut().enumerate() {
            *v = ((i * 7) % 251) as u8;
        }
        let img = Image::from_vec(64, 48, data);

        let fresh = Pyramid::build(&img, 3, 1.0);

        let mut scratch = PyramidScratch::new(64, 48, 1.0);
        let mut reused = Pyramid::empty();
        // Build twice into the same buffers; second result must match a
        // fresh build exactly.
        reused.build_reuse(&img, 3, &mut scratch);
        reused.build_reuse(&img, 3, &mut scratch);

        for lvl in 0..3 {
            assert_eq!(fresh.levels[lvl].width(), reused.levels[lvl].width());
            for (x, y, v) in fresh.levels[lvl].pixels() {
                let r = reused.levels[lvl].get(x, y);
                assert!((v - r).abs() < 1e-6, "level {lvl} pixel ({x},{y}): {v} vs {r}");
            }
        }
    }

    #[test]
    fn test_pyramid_odd_dimensions() {
        let img: Image<u8> = Image::new(101, 75);
        let pyr = Pyramid::build(&img, 3, 1.0);
        assert_eq!(pyr.levels[1].width(), 50);
        assert_eq!(pyr.levels[1].height(), 37);
        assert_eq!(pyr.levels[2].width(), 25);
        assert_eq!(pyr.levels[2].height(), 18);
    }

    #[test]
    #[should_panic(expected = "at least 1")]
    fn test_pyramid_zero_levels_panics() {
        let img: Image<u8> = Image::new(10, 10);
        Pyramid::build(&img, 0, 1.0);
    }
}
