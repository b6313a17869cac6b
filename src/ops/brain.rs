// ============================================================================
// BRAIN MRI PREPROCESSING - enhance, segment, composite
// ============================================================================
//
// The stage order below is the feature-extraction contract the brain models
// were trained against:
//
//   grayscale → normalize → bias-correct → CLAHE → gamma → denoise
//             → segment → apply mask → replicate to 3 channels
//
// Reordering or retuning a stage does not fail anything; it quietly shifts
// the input distribution and costs accuracy. Stages that meet an image they
// cannot process (constant intensity, no foreground) fall back to a no-op,
// log a warning and record a `Fallback` so callers can see it happened.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};

use crate::error::Fallback;
use crate::log_warn;
use crate::ops::adjustments::{adjust_gamma, correct_bias_with, stretch_to_full_range};
use crate::ops::clahe::Clahe;
use crate::ops::denoise::NlMeans;
use crate::ops::filters::gaussian_blur;
use crate::ops::morphology::{self, StructuringElement};
use crate::ops::segmentation::{
    count_regions, largest_region_filled, otsu_threshold, threshold_binary,
};

/// Human-readable stage list reported alongside the brain model.
pub const PREPROCESSING_STAGES: [&str; 5] = [
    "Bias correction",
    "CLAHE",
    "Gamma adjustment",
    "Denoising",
    "Brain masking",
];

pub const GAMMA: f64 = 1.2;
/// Radius of the disk used to open and close the thresholded mask.
pub const CLEANUP_RADIUS: usize = 5;

/// Luma from RGB with the 14-bit fixed-point weights of the reference
/// converter (0.299, 0.587, 0.114), rounded.
pub fn to_grayscale(img: &DynamicImage) -> GrayImage {
    const R: u32 = 4899;
    const G: u32 = 9617;
    const B: u32 = 1868;
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let raw: Vec<u8> = rgb
        .as_raw()
        .chunks_exact(3)
        .map(|p| ((p[0] as u32 * R + p[1] as u32 * G + p[2] as u32 * B + (1 << 13)) >> 14) as u8)
        .collect();
    GrayImage::from_raw(w, h, raw).unwrap_or_else(|| GrayImage::new(w, h))
}

/// Replicate a single channel into RGB.
pub fn to_rgb(gray: &GrayImage) -> RgbImage {
    let (w, h) = gray.dimensions();
    let raw: Vec<u8> = gray.as_raw().iter().flat_map(|&v| [v, v, v]).collect();
    RgbImage::from_raw(w, h, raw).unwrap_or_else(|| RgbImage::new(w, h))
}

/// Output of the full brain pipeline.
#[derive(Clone, Debug)]
pub struct Preprocessed {
    /// Network-ready image, before resizing.
    pub image: RgbImage,
    pub mask: GrayImage,
    pub fallbacks: Vec<Fallback>,
}

/// Tunable copy of the pipeline. `Default` is the training configuration.
#[derive(Clone, Debug)]
pub struct BrainPipeline {
    pub clahe: Clahe,
    pub denoiser: NlMeans,
    pub gamma: f64,
}

impl Default for BrainPipeline {
    fn default() -> Self {
        Self {
            clahe: Clahe::default(),
            denoiser: NlMeans::default(),
            gamma: GAMMA,
        }
    }
}

impl BrainPipeline {
    /// Grayscale → enhance → segment → apply mask → RGB.
    pub fn run(&self, img: &DynamicImage) -> Preprocessed {
        let mut fallbacks = Vec::new();
        let gray = to_grayscale(img);
        let enhanced = self.enhance_with(&gray, &mut fallbacks);
        let mask = segment_with(&enhanced, &mut fallbacks);
        let masked = apply_mask(&enhanced, &mask);
        Preprocessed {
            image: to_rgb(&masked),
            mask,
            fallbacks,
        }
    }

    /// normalize → bias-correct → CLAHE → gamma → denoise.
    pub fn enhance_with(&self, img: &GrayImage, fallbacks: &mut Vec<Fallback>) -> GrayImage {
        let normalized = match stretch_to_full_range(img) {
            Some(n) => n,
            None => {
                log_warn!("enhance: constant-intensity image, skipping normalization");
                fallbacks.push(Fallback::DegenerateImage { stage: "normalize" });
                img.clone()
            }
        };
        let corrected = correct_bias_with(&normalized, fallbacks);
        let equalized = self.clahe.apply(&corrected);
        let brightened = adjust_gamma(&equalized, self.gamma);
        self.denoiser.denoise(&brightened)
    }
}

/// Contrast enhancement with the training parameters.
pub fn enhance(img: &GrayImage) -> GrayImage {
    BrainPipeline::default().enhance_with(img, &mut Vec::new())
}

/// Binary brain mask: a single filled region, or all zeros when the image
/// has no foreground.
pub fn segment(img: &GrayImage) -> GrayImage {
    segment_with(img, &mut Vec::new())
}

pub fn segment_with(img: &GrayImage, fallbacks: &mut Vec<Fallback>) -> GrayImage {
    let rescaled = match stretch_to_full_range(img) {
        Some(r) => r,
        None => {
            log_warn!("segment: constant-intensity image, skipping rescale");
            fallbacks.push(Fallback::DegenerateImage { stage: "segment" });
            img.clone()
        }
    };

    let binary = threshold_binary(&rescaled, otsu_threshold(&rescaled));
    let disk = StructuringElement::disk(CLEANUP_RADIUS);
    let cleaned = morphology::close(&morphology::open(&binary, &disk), &disk);

    let region = match largest_region_filled(&cleaned) {
        Some(region) => region,
        None => {
            log_warn!("segment: no foreground region found, using empty mask");
            fallbacks.push(Fallback::EmptySegmentation);
            // `cleaned` has no foreground, so it is already all zeros.
            cleaned
        }
    };

    let eroded = morphology::erode(&region, &StructuringElement::ellipse(3, 3));
    let smoothed = morphology::close(&eroded, &StructuringElement::ellipse(5, 5));
    // Erosion can pinch a thin neck apart; keep only the main body.
    if count_regions(&smoothed) > 1 {
        largest_region_filled(&smoothed).unwrap_or(smoothed)
    } else {
        smoothed
    }
}

/// Cut `img` to `mask` and soften the cut: pixels in the thin band between
/// the dilated and eroded mask are replaced by a blurred copy of the band.
/// A mask of different size is resized to the image first.
pub fn apply_mask(img: &GrayImage, mask: &GrayImage) -> GrayImage {
    let (w, h) = img.dimensions();
    let mask = if mask.dimensions() != (w, h) {
        imageops::resize(mask, w, h, FilterType::Triangle)
    } else {
        mask.clone()
    };

    let se = StructuringElement::ellipse(3, 3);
    let edge_zone = morphology::subtract_saturating(
        &morphology::dilate(&mask, &se),
        &morphology::erode(&mask, &se),
    );

    let edge_raw: Vec<u8> = img
        .as_raw()
        .iter()
        .zip(edge_zone.as_raw())
        .map(|(&v, &e)| if e != 0 { v } else { 0 })
        .collect();
    let edge_pixels = GrayImage::from_raw(w, h, edge_raw).unwrap_or_else(|| GrayImage::new(w, h));
    let edge_blurred = gaussian_blur(&edge_pixels, 3);

    let raw: Vec<u8> = img
        .as_raw()
        .iter()
        .zip(mask.as_raw())
        .zip(edge_zone.as_raw())
        .zip(edge_blurred.as_raw())
        .map(|(((&v, &m), &e), &b)| {
            let inside = if m != 0 && e != 255 { v } else { 0 };
            inside.saturating_add(b)
        })
        .collect();
    GrayImage::from_raw(w, h, raw).unwrap_or_else(|| GrayImage::new(w, h))
}
