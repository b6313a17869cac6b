// ============================================================================
// ADJUSTMENT OPERATIONS - intensity normalization, gamma, bias-field correction
// ============================================================================
//
// All operations take and return single-channel 8-bit images of the same
// size. Float → u8 conversions truncate, matching how the training images
// were quantized.

use image::GrayImage;
use rayon::prelude::*;

use crate::error::Fallback;
use crate::log_warn;
use crate::ops::filters::gaussian_blur_f32;

/// Kernel size of the blur that estimates the illumination field.
pub const BIAS_KERNEL: usize = 99;
/// Lower bound on the estimated field so the division stays finite.
pub const BIAS_FLOOR: f32 = 0.01;
/// Ranges at or below this are treated as a constant image.
const DEGENERATE_RANGE: f32 = 1e-6;

// ============================================================================
// LOOKUP TABLES
// ============================================================================

/// `out = 255 * (in / 255) ^ (1 / gamma)`, truncated to u8.
pub fn build_gamma_lut(gamma: f64) -> [u8; 256] {
    let inv_gamma = 1.0 / gamma;
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        *entry = ((i as f64 / 255.0).powf(inv_gamma) * 255.0) as u8;
    }
    lut
}

/// Remap every pixel through a 256-entry table, parallel by row.
pub fn apply_lut(img: &GrayImage, lut: &[u8; 256]) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let stride = w as usize;
    let src_raw = img.as_raw();
    let mut dst_raw = vec![0u8; src_raw.len()];
    dst_raw
        .par_chunks_mut(stride)
        .zip(src_raw.par_chunks(stride))
        .for_each(|(row_out, row_in)| {
            for (o, &v) in row_out.iter_mut().zip(row_in) {
                *o = lut[v as usize];
            }
        });
    GrayImage::from_raw(w, h, dst_raw).unwrap_or_else(|| img.clone())
}

/// Gamma adjustment through a lookup table (never a per-pixel power call,
/// so results match the training-time tables bit for bit).
pub fn adjust_gamma(img: &GrayImage, gamma: f64) -> GrayImage {
    apply_lut(img, &build_gamma_lut(gamma))
}

// ============================================================================
// RANGE NORMALIZATION
// ============================================================================

/// Minimum and maximum intensity, or `None` for an empty image.
pub fn intensity_range(img: &GrayImage) -> Option<(u8, u8)> {
    let raw = img.as_raw();
    if raw.is_empty() {
        return None;
    }
    let (min, max) = raw
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    Some((min, max))
}

/// Stretch intensities so the darkest pixel maps to 0 and the brightest to
/// 255. Returns `None` when every pixel has the same value: there is no
/// range to stretch and dividing by it would be undefined.
pub fn stretch_to_full_range(img: &GrayImage) -> Option<GrayImage> {
    let (min, max) = intensity_range(img)?;
    if max <= min {
        return None;
    }
    let range = (max - min) as f64;
    let mut lut = [0u8; 256];
    let span = (max - min) as usize + 1;
    for (i, entry) in lut.iter_mut().enumerate().skip(min as usize).take(span) {
        *entry = ((i as f64 - min as f64) / range * 255.0) as u8;
    }
    Some(apply_lut(img, &lut))
}

/// Rescale a float buffer in place onto [0, 1] using its own min/max.
/// Returns `false` (and clips to [0, 1] instead) when the buffer is flat.
pub fn rescale_unit(buf: &mut [f32]) -> bool {
    if buf.is_empty() {
        return true;
    }
    let (min, max) = buf
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = max - min;
    if span.is_nan() || span <= DEGENERATE_RANGE {
        buf.par_iter_mut().for_each(|v| *v = v.clamp(0.0, 1.0));
        return false;
    }
    buf.par_iter_mut().for_each(|v| *v = ((*v - min) / span).clamp(0.0, 1.0));
    true
}

// ============================================================================
// BIAS-FIELD CORRECTION
// ============================================================================

/// Approximate bias-field removal: divide by a heavily blurred copy of the
/// image (the slow illumination drift), then rescale back to full range.
pub fn correct_bias(img: &GrayImage) -> GrayImage {
    correct_bias_with(img, &mut Vec::new())
}

pub(crate) fn correct_bias_with(img: &GrayImage, fallbacks: &mut Vec<Fallback>) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let unit: Vec<f32> = img.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
    let field = gaussian_blur_f32(&unit, w as usize, h as usize, BIAS_KERNEL);

    let mut corrected: Vec<f32> = unit
        .par_iter()
        .zip(field.par_iter())
        .map(|(&v, &b)| v / b.max(BIAS_FLOOR))
        .collect();

    if !rescale_unit(&mut corrected) {
        log_warn!("bias correction: corrected image is flat, skipping rescale");
        fallbacks.push(Fallback::DegenerateImage {
            stage: "bias_correction",
        });
    }

    let raw: Vec<u8> = corrected.iter().map(|&v| (v * 255.0) as u8).collect();
    GrayImage::from_raw(w, h, raw).unwrap_or_else(|| img.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gradient(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 7 + y * 3) % 200 + 20) as u8]))
    }

    #[test]
    fn gamma_one_is_identity() {
        let lut = build_gamma_lut(1.0);
        for (i, &v) in lut.iter().enumerate() {
            assert_eq!(v as usize, i);
        }
        let img = gradient(32, 16);
        assert_eq!(adjust_gamma(&img, 1.0), img);
    }

    #[test]
    fn gamma_above_one_brightens_midtones() {
        let lut = build_gamma_lut(1.2);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[255], 255);
        assert!(lut[128] > 128);
        for i in 1..256 {
            assert!(lut[i] >= lut[i - 1], "table must be monotonic at {i}");
        }
    }

    #[test]
    fn stretch_truncates_like_training_pipeline() {
        let img = GrayImage::from_raw(3, 1, vec![10, 15, 20]).unwrap();
        let out = stretch_to_full_range(&img).unwrap();
        // 5 / 10 * 255 = 127.5 -> 127
        assert_eq!(out.as_raw(), &vec![0, 127, 255]);
    }

    #[test]
    fn stretch_refuses_constant_image() {
        let img = GrayImage::from_pixel(8, 8, Luma([77]));
        assert!(stretch_to_full_range(&img).is_none());
    }

    #[test]
    fn rescale_unit_reports_flat_buffers() {
        let mut flat = vec![0.5f32; 10];
        assert!(!rescale_unit(&mut flat));
        assert!(flat.iter().all(|&v| v == 0.5));

        let mut ramp = vec![2.0f32, 4.0, 6.0];
        assert!(rescale_unit(&mut ramp));
        assert_eq!(ramp, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn bias_correction_preserves_size_and_spans_range() {
        let img = gradient(48, 40);
        let out = correct_bias(&img);
        assert_eq!(out.dimensions(), img.dimensions());
        let (lo, hi) = intensity_range(&out).unwrap();
        assert_eq!(lo, 0);
        assert_eq!(hi, 255);
    }

    #[test]
    fn bias_correction_on_black_image_reports_fallback() {
        let img = GrayImage::new(20, 20);
        let mut fallbacks = Vec::new();
        let out = correct_bias_with(&img, &mut fallbacks);
        assert_eq!(out.dimensions(), (20, 20));
        assert!(out.pixels().all(|p| p[0] == 0));
        assert_eq!(
            fallbacks,
            vec![Fallback::DegenerateImage {
                stage: "bias_correction"
            }]
        );
    }
}
