// ============================================================================
// IMAGE FILTERS - separable Gaussian blur (grayscale, u8 and f32)
// ============================================================================
//
// Kernel construction and border handling follow the toolchain the networks
// were trained with: odd sizes up to 7 with no sigma use fixed binomial
// tables, larger kernels derive sigma from the size, and borders mirror
// without repeating the edge pixel (reflect-101).

use image::GrayImage;
use rayon::prelude::*;

/// Fixed kernels for ksize 1, 3, 5, 7 when no sigma is given.
const SMALL_GAUSSIAN_TAB: [&[f32]; 4] = [
    &[1.0],
    &[0.25, 0.5, 0.25],
    &[0.0625, 0.25, 0.375, 0.25, 0.0625],
    &[0.03125, 0.109375, 0.21875, 0.28125, 0.21875, 0.109375, 0.03125],
];

/// Mirror an index across the border without repeating the edge pixel
/// (`dcb|abcd|cba`). Loops so kernels wider than the image stay in range.
#[inline]
pub(crate) fn reflect_101(mut i: isize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let last = n as isize - 1;
    while i < 0 || i > last {
        if i < 0 {
            i = -i;
        }
        if i > last {
            i = 2 * last - i;
        }
    }
    i as usize
}

/// Sigma implied by a kernel size when the caller passes `sigma <= 0`.
pub fn default_sigma(ksize: usize) -> f64 {
    0.3 * ((ksize as f64 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Build a normalized 1-D Gaussian kernel of `ksize` taps.
pub fn gaussian_kernel(ksize: usize, sigma: f64) -> Vec<f32> {
    let ksize = ksize.max(1) | 1;
    if sigma <= 0.0 && ksize <= 7 {
        return SMALL_GAUSSIAN_TAB[ksize / 2].to_vec();
    }
    let sigma = if sigma > 0.0 { sigma } else { default_sigma(ksize) };
    let radius = (ksize / 2) as f64;
    let scale = -0.5 / (sigma * sigma);
    let raw: Vec<f64> = (0..ksize)
        .map(|i| {
            let x = i as f64 - radius;
            (scale * x * x).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.iter().map(|v| (v / sum) as f32).collect()
}

/// Separable Gaussian blur over a single-channel f32 buffer, parallel by row.
pub fn gaussian_blur_f32(src: &[f32], width: usize, height: usize, ksize: usize) -> Vec<f32> {
    if width == 0 || height == 0 {
        return src.to_vec();
    }
    let kernel = gaussian_kernel(ksize, 0.0);
    let radius = (kernel.len() / 2) as isize;

    // Column lookup is shared by every row of the horizontal pass.
    let col_taps: Vec<Vec<usize>> = (0..width)
        .map(|x| {
            (0..kernel.len())
                .map(|k| reflect_101(x as isize + k as isize - radius, width))
                .collect()
        })
        .collect();

    // --- Horizontal pass ---
    let mut buf_h = vec![0.0f32; width * height];
    buf_h
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row_out)| {
            let row_in = &src[y * width..(y + 1) * width];
            for (x, out) in row_out.iter_mut().enumerate() {
                let taps = &col_taps[x];
                let mut acc = 0.0f32;
                for (k, &kv) in kernel.iter().enumerate() {
                    acc += row_in[taps[k]] * kv;
                }
                *out = acc;
            }
        });

    // --- Vertical pass ---
    let mut buf_v = vec![0.0f32; width * height];
    buf_v
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row_out)| {
            for (k, &kv) in kernel.iter().enumerate() {
                let sy = reflect_101(y as isize + k as isize - radius, height);
                let row_in = &buf_h[sy * width..(sy + 1) * width];
                for (out, &v) in row_out.iter_mut().zip(row_in) {
                    *out += v * kv;
                }
            }
        });

    buf_v
}

/// Gaussian blur of an 8-bit grayscale image; results are rounded.
pub fn gaussian_blur(img: &GrayImage, ksize: usize) -> GrayImage {
    let (w, h) = img.dimensions();
    let src: Vec<f32> = img.as_raw().iter().map(|&v| v as f32).collect();
    let blurred = gaussian_blur_f32(&src, w as usize, h as usize, ksize);
    let raw: Vec<u8> = blurred
        .iter()
        .map(|&v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    GrayImage::from_raw(w, h, raw).unwrap_or_else(|| GrayImage::new(w, h))
}
