use image::RgbImage;
use image::imageops::{self, FilterType};

use crate::model::checkpoint::Normalization;

/// Resize to `size × size` (bilinear) and lay out as a normalized
/// `[1, 3, size, size]` float tensor, one plane per channel.
pub fn to_chw_tensor(input: &RgbImage, size: u32, norm: &Normalization) -> Vec<f32> {
    let resized;
    let img = if input.dimensions() == (size, size) {
        input
    } else {
        resized = imageops::resize(input, size, size, FilterType::Triangle);
        &resized
    };

    let npixels = size as usize * size as usize;
    let mut tensor = vec![0.0f32; 3 * npixels];
    for (idx, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            tensor[c * npixels + idx] = (pixel[c] as f32 / 255.0 - norm.mean[c]) / norm.std[c];
        }
    }
    tensor
}

/// Numerically stable softmax in f64.
pub fn softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .fold(f64::NEG_INFINITY, |m, &v| m.max(v as f64));
    let exps: Vec<f64> = logits.iter().map(|&v| (v as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Index of the largest value; the first one wins ties.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn chw_layout_and_normalization() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 51]));
        let norm = Normalization {
            mean: [0.5, 0.5, 0.0],
            std: [0.5, 0.5, 1.0],
        };
        let t = to_chw_tensor(&img, 2, &norm);
        assert_eq!(t.len(), 12);
        assert!(t[..4].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(t[4..8].iter().all(|&v| (v + 1.0).abs() < 1e-6));
        assert!(t[8..].iter().all(|&v| (v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn resizes_to_square_target() {
        let img = RgbImage::from_pixel(40, 20, Rgb([10, 20, 30]));
        let t = to_chw_tensor(&img, 8, &Normalization::IMAGENET);
        assert_eq!(t.len(), 3 * 64);
    }

    #[test]
    fn softmax_sums_to_one_and_survives_large_logits() {
        let p = softmax(&[1000.0, 1000.0, -1000.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((p[0] - 0.5).abs() < 1e-12);
        assert_eq!(p[2], 0.0);
    }

    #[test]
    fn argmax_prefers_first_of_equals() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
